//! Polling loops of the evaluator service
//!
//! One loop per alert kind fetches the instruments its rules watch, runs
//! every observation through the [`Evaluator`] and publishes the resulting
//! decisions. A failed publish is logged and dropped: the rule has already
//! advanced its suppression window.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::broker::AlertPublisher;
use crate::engine::{Evaluator, Observation};
use crate::fetch::{MetricClientRegistry, PredictionFetcher, PriceFetcher};
use crate::rules::{MetricSubject, RuleKind, RuleSource, RuleStore, RuleSubject, SourceError};
use crate::shutdown::ShutdownListener;

/// Counters for one evaluator process
#[derive(Debug, Default, Clone)]
pub struct MonitorStats {
    pub cycles: u64,
    pub observations: u64,
    pub fetch_failures: u64,
    pub decisions: u64,
    pub published: u64,
    pub publish_failures: u64,
}

pub struct Monitor {
    evaluator: Evaluator,
    publisher: AlertPublisher,
    stats: Arc<RwLock<MonitorStats>>,
}

impl Monitor {
    pub fn new(evaluator: Evaluator, publisher: AlertPublisher) -> Self {
        Self {
            evaluator,
            publisher,
            stats: Arc::new(RwLock::new(MonitorStats::default())),
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        self.evaluator.store()
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats.read().clone()
    }

    /// Evaluate one observation and publish every decision; returns how many were published
    pub async fn dispatch(&self, observation: &Observation) -> usize {
        let decisions = self.evaluator.evaluate(observation);
        self.stats.write().observations += 1;

        let mut published = 0;
        for decision in &decisions {
            match self.publisher.publish(decision).await {
                Ok(()) => published += 1,
                Err(e) => {
                    tracing::error!(
                        kind = %decision.kind(),
                        rule_id = ?decision.rule.id,
                        error = %e,
                        "Failed to publish alert"
                    );
                }
            }
        }

        let mut stats = self.stats.write();
        stats.decisions += decisions.len() as u64;
        stats.published += published as u64;
        stats.publish_failures += (decisions.len() - published) as u64;
        published
    }

    fn record_fetch_failure(&self) {
        self.stats.write().fetch_failures += 1;
    }

    /// One price cycle: each distinct (symbol, feed) is fetched once
    pub async fn check_prices(&self, fetcher: &dyn PriceFetcher) {
        let feeds: BTreeSet<(String, String)> = self
            .store()
            .snapshot(RuleKind::Price)
            .into_iter()
            .filter(|r| r.enabled)
            .filter_map(|r| match r.subject {
                RuleSubject::Price(p) => Some((p.symbol, p.price_feed_id)),
                _ => None,
            })
            .collect();

        let fetches = feeds
            .iter()
            .map(|(symbol, feed)| fetcher.fetch_price(symbol, feed));
        let results = join_all(fetches).await;

        for ((symbol, _), result) in feeds.iter().zip(results) {
            match result {
                Ok(price) => {
                    tracing::debug!(symbol = %symbol, price = price.price, "Price observed");
                    self.dispatch(&Observation::Price(price)).await;
                }
                Err(e) => {
                    self.record_fetch_failure();
                    tracing::warn!(symbol = %symbol, error = %e, "Failed to fetch price");
                }
            }
        }
    }

    /// One metric cycle: each distinct (protocol, chain, instrument, field) is read once
    pub async fn check_metrics(&self, registry: &MetricClientRegistry) {
        let mut subjects: BTreeMap<(String, String, String, String), MetricSubject> = BTreeMap::new();
        for rule in self.store().snapshot(RuleKind::Metric) {
            if !rule.enabled {
                continue;
            }
            if let RuleSubject::Metric(s) = rule.subject {
                let key = (
                    s.protocol.to_ascii_lowercase(),
                    s.chain_id.clone(),
                    s.instrument.clone(),
                    s.field.to_string(),
                );
                subjects.entry(key).or_insert(s);
            }
        }

        let results = join_all(subjects.values().map(|s| registry.fetch(s))).await;

        for (subject, result) in subjects.values().zip(results) {
            match result {
                Ok(metric) => {
                    tracing::debug!(
                        protocol = %subject.protocol,
                        instrument = %subject.instrument,
                        field = %subject.field,
                        value = metric.value,
                        "Metric observed"
                    );
                    self.dispatch(&Observation::Metric(metric)).await;
                }
                Err(e) => {
                    self.record_fetch_failure();
                    tracing::warn!(
                        protocol = %subject.protocol,
                        chain_id = %subject.chain_id,
                        instrument = %subject.instrument,
                        error = %e,
                        "Failed to fetch metric"
                    );
                }
            }
        }
    }

    /// One prediction cycle: all tokens in one batch, each token dispatched once
    pub async fn check_predictions(&self, fetcher: &dyn PredictionFetcher) {
        let tokens: BTreeSet<String> = self
            .store()
            .snapshot(RuleKind::Prediction)
            .into_iter()
            .filter(|r| r.enabled)
            .filter_map(|r| match r.subject {
                RuleSubject::Prediction(p) => Some(p.token_id),
                _ => None,
            })
            .collect();
        if tokens.is_empty() {
            return;
        }

        let token_ids: Vec<String> = tokens.into_iter().collect();
        let quotes = match fetcher.fetch_tokens(&token_ids).await {
            Ok(quotes) => quotes,
            Err(e) => {
                self.record_fetch_failure();
                tracing::warn!(tokens = token_ids.len(), error = %e, "Failed to fetch prediction prices");
                return;
            }
        };

        for token_id in &token_ids {
            match quotes.get(token_id) {
                Some(quote) => {
                    self.dispatch(&Observation::Prediction(quote.clone())).await;
                }
                None => tracing::debug!(token_id = %token_id, "No quote for prediction token"),
            }
        }
    }

    fn spawn_loop<F>(
        self: Arc<Self>,
        name: &'static str,
        period: Duration,
        mut shutdown: ShutdownListener,
        cycle: F,
    ) -> JoinHandle<()>
    where
        F: for<'a> Fn(&'a Monitor) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(monitor = name, interval = ?period, "Monitor loop started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(monitor = name, "Monitor loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        cycle(self.as_ref()).await;
                        self.stats.write().cycles += 1;
                    }
                }
            }
        })
    }

    pub fn start_price_loop(
        self: Arc<Self>,
        fetcher: Arc<dyn PriceFetcher>,
        period: Duration,
        shutdown: ShutdownListener,
    ) -> JoinHandle<()> {
        self.spawn_loop("price", period, shutdown, move |monitor: &Monitor| {
            let fetcher = fetcher.clone();
            async move { monitor.check_prices(fetcher.as_ref()).await }.boxed()
        })
    }

    pub fn start_metric_loop(
        self: Arc<Self>,
        registry: Arc<MetricClientRegistry>,
        period: Duration,
        shutdown: ShutdownListener,
    ) -> JoinHandle<()> {
        self.spawn_loop("metric", period, shutdown, move |monitor: &Monitor| {
            let registry = registry.clone();
            async move { monitor.check_metrics(&registry).await }.boxed()
        })
    }

    pub fn start_prediction_loop(
        self: Arc<Self>,
        fetcher: Arc<dyn PredictionFetcher>,
        period: Duration,
        shutdown: ShutdownListener,
    ) -> JoinHandle<()> {
        self.spawn_loop("prediction", period, shutdown, move |monitor: &Monitor| {
            let fetcher = fetcher.clone();
            async move { monitor.check_predictions(fetcher.as_ref()).await }.boxed()
        })
    }
}

/// Load `source` into `store`, carrying suppression state over by rule id
pub async fn reload_rules(store: &RuleStore, source: &dyn RuleSource) -> Result<usize, SourceError> {
    let rules = source.load().await?;
    let total = rules.len();
    let carried = store.replace_all(rules);
    tracing::info!(
        source = %source.describe(),
        rules = total,
        carried,
        "Alert rules reloaded"
    );
    Ok(total)
}

/// Periodically reload rules; a failed load keeps the current rules
pub fn spawn_reload_loop(
    store: Arc<RuleStore>,
    source: Arc<dyn RuleSource>,
    period: Duration,
    mut shutdown: ShutdownListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately and the rules were just loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Rule reload loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = reload_rules(&store, source.as_ref()).await {
                        tracing::warn!(
                            source = %source.describe(),
                            error = %e,
                            "Rule reload failed, keeping current rules"
                        );
                    }
                }
            }
        }
    })
}

/// Log what each loop will watch
pub fn log_monitored(store: &RuleStore) {
    let rules = store.snapshot_all();

    let symbols: BTreeSet<&str> = rules
        .rules(RuleKind::Price)
        .iter()
        .filter_map(|r| match &r.subject {
            RuleSubject::Price(p) => Some(p.symbol.as_str()),
            _ => None,
        })
        .collect();
    tracing::info!(count = symbols.len(), symbols = ?symbols, "Monitoring price symbols");

    for rule in rules.rules(RuleKind::Metric) {
        tracing::info!(
            rule = %rule.subject.label(),
            threshold = rule.threshold,
            direction = %rule.direction,
            enabled = rule.enabled,
            "Monitoring metric rule"
        );
    }

    let tokens: BTreeSet<&str> = rules
        .rules(RuleKind::Prediction)
        .iter()
        .filter_map(|r| match &r.subject {
            RuleSubject::Prediction(p) => Some(p.token_id.as_str()),
            _ => None,
        })
        .collect();
    tracing::info!(count = tokens.len(), tokens = ?tokens, "Monitoring prediction tokens");
}

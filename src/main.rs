//! Tripwire evaluator
//!
//! Run with: cargo run --features kafka
//!
//! Environment variables:
//! - TRIPWIRE_RULES_FILE: JSON rule file (default: alert-rules.json)
//! - TRIPWIRE_CHECK_INTERVAL_SECS: Polling interval (default: 60)
//! - TRIPWIRE_RULE_RELOAD_SECS: Rule reload interval, 0 disables (default: 0)
//! - PYTH_API_URL / PYTH_API_KEY: Pyth Hermes endpoint and optional key
//! - POLYMARKET_API_URL: Polymarket CLOB endpoint
//! - KAMINO_API_URL: Kamino REST endpoint
//! - KAFKA_BROKERS: Broker list (default: localhost:9092)
//! - RUST_LOG: Log level (default: tripwire=info)

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tripwire::broker::kafka::KafkaSink;
use tripwire::broker::AlertPublisher;
use tripwire::config::{EvaluatorConfig, KafkaConfig};
use tripwire::engine::Evaluator;
use tripwire::fetch::{KaminoVaultClient, MetricClientRegistry, PolymarketClient, PythClient};
use tripwire::monitor::{log_monitored, reload_rules, spawn_reload_loop, Monitor};
use tripwire::rules::{FileRuleSource, RuleSource, RuleStore, SourceError};
use tripwire::Shutdown;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tripwire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EvaluatorConfig::from_env()?;
    let kafka_config = KafkaConfig::from_env()?;

    tracing::info!("Tripwire evaluator configuration:");
    tracing::info!("  Rules file: {}", config.rules_file.display());
    tracing::info!("  Check interval: {:?}", config.check_interval);
    match config.reload_interval {
        Some(every) => tracing::info!("  Rule reload: every {:?}", every),
        None => tracing::info!("  Rule reload: DISABLED"),
    }
    tracing::info!("  Brokers: {}", kafka_config.brokers);

    // Rules must load before anything starts
    let source: Arc<dyn RuleSource> = Arc::new(FileRuleSource::new(config.rules_file.clone()));
    let store = Arc::new(RuleStore::new());
    reload_rules(&store, source.as_ref()).await?;
    if store.is_empty() {
        return Err(SourceError::Empty(source.describe()).into());
    }
    log_monitored(&store);

    let sink = KafkaSink::new(&kafka_config)?;
    let publisher = AlertPublisher::new(Arc::new(sink));
    let monitor = Arc::new(Monitor::new(Evaluator::new(store.clone()), publisher));

    let pyth = Arc::new(PythClient::new(
        config.pyth_api_url.clone(),
        config.pyth_api_key.clone(),
        config.http_timeout,
    ));
    let polymarket = Arc::new(PolymarketClient::new(
        config.polymarket_api_url.clone(),
        config.http_timeout,
    ));
    let registry = Arc::new(MetricClientRegistry::new().with_protocol(
        "kamino",
        KaminoVaultClient::factory(config.kamino_api_url.clone(), config.http_timeout),
    ));
    tracing::info!(protocols = ?registry.protocols(), "Metric clients registered");

    let shutdown = Shutdown::new();
    let mut tasks = vec![
        monitor
            .clone()
            .start_price_loop(pyth, config.check_interval, shutdown.listener()),
        monitor
            .clone()
            .start_metric_loop(registry, config.check_interval, shutdown.listener()),
        monitor
            .clone()
            .start_prediction_loop(polymarket, config.check_interval, shutdown.listener()),
    ];
    if let Some(every) = config.reload_interval {
        tasks.push(spawn_reload_loop(store, source, every, shutdown.listener()));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    shutdown.trigger();

    if tokio::time::timeout(Duration::from_secs(1), futures::future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!("Monitor loops did not stop within the grace period");
    }

    let stats = monitor.stats();
    tracing::info!(
        cycles = stats.cycles,
        decisions = stats.decisions,
        published = stats.published,
        publish_failures = stats.publish_failures,
        "Tripwire evaluator stopped"
    );
    Ok(())
}

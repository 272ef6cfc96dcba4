//! Per-kind delivery worker
//!
//! ## State machine
//!
//! ```text
//! Bootstrapping -> Connected -> Consuming <-> Backoff
//!                                   |
//!                       (shutdown)  v
//!                              Draining -> Stopped
//! ```
//!
//! - A message is committed once the notification attempt has completed,
//!   whether the send succeeded or failed. Undecodable payloads are committed
//!   too.
//! - A fetch error commits nothing: the consumer is dropped, the worker waits
//!   (2s doubling to 60s, reset after the next successful fetch) and
//!   reconnects.
//! - On shutdown the worker does not wait for an in-flight fetch to finish:
//!   the fetch is abandoned and nothing is committed for it, so the message
//!   is redelivered to the next consumer in the group. A message already
//!   handed to the notifier is finished and committed first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::broker::backoff::Backoff;
use crate::broker::bootstrap::{init_group_offsets, wait_for_coordinator, GroupSpec};
use crate::broker::events::{group_for, topic_for, AlertEnvelope};
use crate::broker::{AlertConsumer, BrokerAdmin, BrokerMessage, ConsumerFactory};
use crate::delivery::view::AlertView;
use crate::notify::Notifier;
use crate::rules::RuleKind;
use crate::shutdown::{Shutdown, ShutdownListener};

/// Settings for one worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub kind: RuleKind,
    pub group: String,
    pub topic: String,
    /// Longest single wait for a message before re-checking shutdown
    pub fetch_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl WorkerConfig {
    /// Group `{prefix}-token|defi|predict` on the kind's alert topic
    pub fn for_kind(group_prefix: &str, kind: RuleKind) -> Self {
        Self {
            kind,
            group: group_for(group_prefix, kind),
            topic: topic_for(kind).to_string(),
            fetch_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Bootstrapping,
    Connected,
    Consuming,
    Backoff,
    Draining,
    Stopped,
}

/// Counters exposed by a running worker
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub state: WorkerState,
    pub messages_received: u64,
    pub delivered: u64,
    pub send_failures: u64,
    pub decode_errors: u64,
    pub fetch_errors: u64,
    pub commit_failures: u64,
    pub reconnects: u64,
    /// Last committed offset per partition
    pub last_offset: HashMap<i32, i64>,
}

pub struct DeliveryWorker {
    config: WorkerConfig,
    factory: Arc<dyn ConsumerFactory>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<RwLock<WorkerStats>>,
}

impl DeliveryWorker {
    pub fn new(
        config: WorkerConfig,
        factory: Arc<dyn ConsumerFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            factory,
            notifier,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
        }
    }

    /// Snapshot of the current counters
    pub fn stats(&self) -> WorkerStats {
        self.stats.read().clone()
    }

    pub fn stats_handle(&self) -> Arc<RwLock<WorkerStats>> {
        self.stats.clone()
    }

    /// Start consuming in background
    pub fn start(self, shutdown: ShutdownListener) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: ShutdownListener) {
        let topic = self.config.topic.clone();
        let group = self.config.group.clone();
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        tracing::info!(topic = %topic, group = %group, "Delivery worker started");

        'connect: loop {
            if shutdown.is_cancelled() {
                break;
            }

            let mut consumer = match self.factory.connect(&group, &topic).await {
                Ok(consumer) => consumer,
                Err(e) => {
                    self.stats.write().fetch_errors += 1;
                    if !self.pause(&mut backoff, &mut shutdown, &e.to_string()).await {
                        break;
                    }
                    continue;
                }
            };
            self.set_state(WorkerState::Connected);

            loop {
                if shutdown.is_cancelled() {
                    break 'connect;
                }
                self.set_state(WorkerState::Consuming);

                let fetched = tokio::select! {
                    _ = shutdown.cancelled() => break 'connect,
                    fetched = tokio::time::timeout(self.config.fetch_timeout, consumer.fetch()) => fetched,
                };

                match fetched {
                    // idle topic; loop to re-check shutdown
                    Err(_elapsed) => continue,
                    Ok(Ok(message)) => {
                        backoff.reset();
                        self.handle(consumer.as_mut(), message).await;
                    }
                    Ok(Err(e)) => {
                        {
                            let mut stats = self.stats.write();
                            stats.fetch_errors += 1;
                            stats.reconnects += 1;
                        }
                        drop(consumer);
                        if !self.pause(&mut backoff, &mut shutdown, &e.to_string()).await {
                            break 'connect;
                        }
                        continue 'connect;
                    }
                }
            }
        }

        self.set_state(WorkerState::Draining);
        tracing::info!(topic = %topic, group = %group, "Delivery worker shutting down");
        self.set_state(WorkerState::Stopped);
    }

    /// Wait out one backoff step; `false` if shutdown arrived meanwhile
    async fn pause(&self, backoff: &mut Backoff, shutdown: &mut ShutdownListener, reason: &str) -> bool {
        self.set_state(WorkerState::Backoff);
        let delay = backoff.next_delay();
        tracing::warn!(
            topic = %self.config.topic,
            error = %reason,
            backoff = ?delay,
            "Read error, reconnecting after backoff"
        );

        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Decode, notify, then commit regardless of the send outcome
    async fn handle(&self, consumer: &mut dyn AlertConsumer, message: BrokerMessage) {
        self.stats.write().messages_received += 1;

        match AlertEnvelope::decode(self.config.kind, &message.payload) {
            Ok(envelope) => {
                let view = AlertView::from_envelope(&envelope);
                match self.notifier.send(&view.target, &view).await {
                    Ok(()) => {
                        tracing::info!(
                            topic = %message.topic,
                            partition = message.partition,
                            offset = message.offset,
                            recipient = %view.target,
                            "Alert delivered"
                        );
                        self.stats.write().delivered += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            topic = %message.topic,
                            partition = message.partition,
                            offset = message.offset,
                            recipient = %view.target,
                            error = %e,
                            "Failed to deliver alert"
                        );
                        self.stats.write().send_failures += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Dropping undecodable alert envelope"
                );
                self.stats.write().decode_errors += 1;
            }
        }

        match consumer.commit(&message).await {
            Ok(()) => {
                self.stats
                    .write()
                    .last_offset
                    .insert(message.partition, message.offset);
            }
            Err(e) => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Failed to commit offset"
                );
                self.stats.write().commit_failures += 1;
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.stats.write().state = state;
    }
}

/// Settings shared by the three workers of a delivery process
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub group_prefix: String,
    pub fetch_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            group_prefix: "notification-service".to_string(),
            fetch_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// A spawned worker and its counters
pub struct WorkerHandle {
    pub kind: RuleKind,
    pub handle: JoinHandle<()>,
    pub stats: Arc<RwLock<WorkerStats>>,
}

/// Wait for the coordinator, pin fresh groups to the earliest offset, then
/// spawn one worker per alert kind
///
/// Returns no workers if shutdown arrives during the coordinator wait.
pub async fn start_delivery(
    admin: &dyn BrokerAdmin,
    factory: Arc<dyn ConsumerFactory>,
    notifier: Arc<dyn Notifier>,
    settings: &DeliverySettings,
    shutdown: &Shutdown,
) -> Vec<WorkerHandle> {
    let mut listener = shutdown.listener();
    if !wait_for_coordinator(admin, settings.probe_timeout, &mut listener).await {
        return Vec::new();
    }

    let configs: Vec<WorkerConfig> = RuleKind::ALL
        .iter()
        .map(|&kind| {
            WorkerConfig::for_kind(&settings.group_prefix, kind)
                .with_fetch_timeout(settings.fetch_timeout)
        })
        .collect();

    let specs: Vec<GroupSpec> = configs
        .iter()
        .map(|c| GroupSpec::new(c.group.clone(), c.topic.clone()))
        .collect();
    init_group_offsets(admin, &specs).await;

    configs
        .into_iter()
        .map(|config| {
            let kind = config.kind;
            let worker = DeliveryWorker::new(config, factory.clone(), notifier.clone());
            let stats = worker.stats_handle();
            WorkerHandle {
                kind,
                handle: worker.start(shutdown.listener()),
                stats,
            }
        })
        .collect()
}

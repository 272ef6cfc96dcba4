//! Startup checks run before any delivery consumer is created

use std::collections::BTreeMap;
use std::time::Duration;

use super::backoff::Backoff;
use super::BrokerAdmin;
use crate::shutdown::ShutdownListener;

/// Group used only to look up the coordinator
pub const COORDINATOR_PROBE_GROUP: &str = "__notification_healthcheck__";

/// Block until the group coordinator answers, backing off 1s to 30s
///
/// Returns `false` if shutdown was requested first.
pub async fn wait_for_coordinator(
    admin: &dyn BrokerAdmin,
    probe_timeout: Duration,
    shutdown: &mut ShutdownListener,
) -> bool {
    let mut backoff = Backoff::coordinator();

    loop {
        if shutdown.is_cancelled() {
            return false;
        }

        let reason = match tokio::time::timeout(
            probe_timeout,
            admin.find_coordinator(COORDINATOR_PROBE_GROUP),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::info!("Group coordinator is ready");
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("probe timed out after {:?}", probe_timeout),
        };

        let delay = backoff.next_delay();
        tracing::warn!(
            reason = %reason,
            backoff = ?delay,
            "Waiting for group coordinator"
        );

        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// A consumer group and the topic it reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub group: String,
    pub topic: String,
}

impl GroupSpec {
    pub fn new(group: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            topic: topic.into(),
        }
    }
}

/// What offset bootstrap did for one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetInit {
    /// Every partition already had a committed offset; left untouched
    AlreadyCommitted,
    /// Partitions without a commit were pinned to these earliest offsets
    Initialized(BTreeMap<i32, i64>),
    /// Lookup or commit failed; the consumer's reset policy applies
    Failed(String),
}

/// Pin brand-new groups to the start of their topic
///
/// For each partition with no committed offset, commits the earliest retained
/// offset so events produced before the first connection are not skipped.
/// Partitions that already have a commit are never moved. Failures are
/// logged and reported, never fatal.
pub async fn init_group_offsets(
    admin: &dyn BrokerAdmin,
    specs: &[GroupSpec],
) -> Vec<(GroupSpec, OffsetInit)> {
    let mut outcomes = Vec::with_capacity(specs.len());

    for spec in specs {
        let outcome = match init_one(admin, spec).await {
            Ok(outcome) => outcome,
            Err(reason) => {
                tracing::warn!(
                    group = %spec.group,
                    topic = %spec.topic,
                    error = %reason,
                    "Offset bootstrap failed"
                );
                OffsetInit::Failed(reason)
            }
        };
        outcomes.push((spec.clone(), outcome));
    }

    outcomes
}

async fn init_one(admin: &dyn BrokerAdmin, spec: &GroupSpec) -> Result<OffsetInit, String> {
    let committed = admin
        .committed_offsets(&spec.group, &spec.topic)
        .await
        .map_err(|e| e.to_string())?;

    if committed.is_empty() {
        return Err(format!("topic {} reported no partitions", spec.topic));
    }

    let missing: Vec<i32> = committed
        .iter()
        .filter(|(_, offset)| offset.is_none())
        .map(|(&partition, _)| partition)
        .collect();

    if missing.is_empty() {
        tracing::info!(
            group = %spec.group,
            topic = %spec.topic,
            offsets = ?committed,
            "Committed offsets found, resuming from there"
        );
        return Ok(OffsetInit::AlreadyCommitted);
    }

    let earliest = admin
        .earliest_offsets(&spec.topic)
        .await
        .map_err(|e| e.to_string())?;

    let pinned: BTreeMap<i32, i64> = missing
        .into_iter()
        .filter_map(|partition| earliest.get(&partition).map(|&offset| (partition, offset)))
        .collect();

    if pinned.is_empty() {
        return Err("no earliest offsets reported for uncommitted partitions".to_string());
    }

    admin
        .commit_offsets(&spec.group, &spec.topic, &pinned)
        .await
        .map_err(|e| e.to_string())?;

    tracing::info!(
        group = %spec.group,
        topic = %spec.topic,
        offsets = ?pinned,
        "No prior offset found, initialized to earliest"
    );
    Ok(OffsetInit::Initialized(pinned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, OffsetReset};
    use crate::broker::{BrokerError, ConsumerFactory, EventSink};
    use async_trait::async_trait;

    /// Admin for a topic that does not exist yet
    struct NoPartitions;

    #[async_trait]
    impl BrokerAdmin for NoPartitions {
        async fn find_coordinator(&self, _group: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn committed_offsets(
            &self,
            _group: &str,
            _topic: &str,
        ) -> Result<BTreeMap<i32, Option<i64>>, BrokerError> {
            Ok(BTreeMap::new())
        }

        async fn earliest_offsets(&self, _topic: &str) -> Result<BTreeMap<i32, i64>, BrokerError> {
            Ok(BTreeMap::new())
        }

        async fn commit_offsets(
            &self,
            _group: &str,
            _topic: &str,
            _offsets: &BTreeMap<i32, i64>,
        ) -> Result<(), BrokerError> {
            Ok(())
        }
    }
    use crate::shutdown::Shutdown;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_coordinator_backs_off_until_ready() {
        let broker = MemoryBroker::new();
        broker.set_coordinator_ready(false);
        let shutdown = Shutdown::new();

        let admin = broker.clone();
        let mut listener = shutdown.listener();
        let waiter = tokio::spawn(async move {
            wait_for_coordinator(&admin, Duration::from_secs(5), &mut listener).await
        });

        // probes at t=0, 1s, 3s, 7s
        tokio::time::sleep(Duration::from_millis(7_500)).await;
        assert_eq!(broker.coordinator_probes(), 4);

        broker.set_coordinator_ready(true);
        assert!(waiter.await.unwrap());
        assert_eq!(broker.coordinator_probes(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_coordinator_honors_shutdown() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();

        let admin = broker.clone();
        let waiter = tokio::spawn(async move {
            wait_for_coordinator(&admin, Duration::from_secs(5), &mut listener).await
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        shutdown.trigger();

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_group_pinned_to_earliest() {
        let broker = MemoryBroker::with_options(1, OffsetReset::Latest);
        for payload in [b"one", b"two"] {
            broker.send("alerts.token", "k", payload.to_vec()).await.unwrap();
        }

        let spec = GroupSpec::new("svc-token", "alerts.token");
        let outcomes = init_group_offsets(&broker, &[spec]).await;
        assert_eq!(
            outcomes[0].1,
            OffsetInit::Initialized(BTreeMap::from([(0, 0)]))
        );

        let mut consumer = broker.connect("svc-token", "alerts.token").await.unwrap();
        assert_eq!(consumer.fetch().await.unwrap().payload, b"one");
    }

    #[tokio::test]
    async fn test_existing_commit_left_alone() {
        let broker = MemoryBroker::new();
        for _ in 0..3 {
            broker.send("alerts.defi", "k", vec![]).await.unwrap();
        }
        broker
            .commit_offsets("svc-defi", "alerts.defi", &BTreeMap::from([(0, 2)]))
            .await
            .unwrap();

        let outcomes =
            init_group_offsets(&broker, &[GroupSpec::new("svc-defi", "alerts.defi")]).await;
        assert_eq!(outcomes[0].1, OffsetInit::AlreadyCommitted);
        assert_eq!(broker.committed("svc-defi", "alerts.defi", 0), Some(2));
    }

    #[tokio::test]
    async fn test_only_uncommitted_partitions_are_pinned() {
        let broker = MemoryBroker::with_options(2, OffsetReset::Latest);
        broker
            .commit_offsets("g", "t", &BTreeMap::from([(0, 5)]))
            .await
            .unwrap();

        let outcomes = init_group_offsets(&broker, &[GroupSpec::new("g", "t")]).await;
        assert_eq!(outcomes[0].1, OffsetInit::Initialized(BTreeMap::from([(1, 0)])));
        assert_eq!(broker.committed("g", "t", 0), Some(5));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_reported() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let outcomes = init_group_offsets(&broker, &[GroupSpec::new("g", "t")]).await;
        assert!(matches!(outcomes[0].1, OffsetInit::Failed(_)));
    }

    #[tokio::test]
    async fn test_topic_without_partitions_is_not_committed() {
        let outcomes =
            init_group_offsets(&NoPartitions, &[GroupSpec::new("g", "alerts.token")]).await;
        assert_eq!(
            outcomes[0].1,
            OffsetInit::Failed("topic alerts.token reported no partitions".to_string())
        );
    }
}

//! In-process broker with consumer-group semantics
//!
//! Mirrors the parts of a partitioned log the delivery path depends on:
//! - records are appended to a partition chosen by key hash
//! - each consumer tracks its own read position, starting from the group's
//!   committed offset, or from the [`OffsetReset`] policy when none exists
//! - commits store the *next* offset to read, per (group, topic, partition)
//! - outages can be toggled to exercise reconnect and bootstrap paths

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{AlertConsumer, BrokerAdmin, BrokerError, BrokerMessage, ConsumerFactory, EventSink};

/// Where a consumer starts when its group has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of `records[0]`; advanced by retention
    base: i64,
    records: Vec<BrokerMessage>,
}

impl PartitionLog {
    fn end(&self) -> i64 {
        self.base + self.records.len() as i64
    }

    fn get(&self, offset: i64) -> Option<&BrokerMessage> {
        let index = usize::try_from(offset - self.base).ok()?;
        self.records.get(index)
    }
}

#[derive(Debug)]
struct State {
    topics: HashMap<String, Vec<PartitionLog>>,
    committed: HashMap<(String, String, i32), i64>,
    available: bool,
    coordinator_ready: bool,
    failing_fetches: usize,
    connections: usize,
    coordinator_probes: usize,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    partitions: i32,
    reset: OffsetReset,
}

impl Inner {
    fn wake(&self) {
        self.notify.notify_waiters();
    }
}

/// Shared handle; clones see the same log
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Single-partition topics, `Latest` reset
    pub fn new() -> Self {
        Self::with_options(1, OffsetReset::default())
    }

    pub fn with_options(partitions: i32, reset: OffsetReset) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    topics: HashMap::new(),
                    committed: HashMap::new(),
                    available: true,
                    coordinator_ready: true,
                    failing_fetches: 0,
                    connections: 0,
                    coordinator_probes: 0,
                }),
                notify: Notify::new(),
                partitions: partitions.max(1),
                reset,
            }),
        }
    }

    /// Simulate the whole cluster going away or coming back
    pub fn set_available(&self, available: bool) {
        self.inner.state.lock().available = available;
        self.inner.wake();
    }

    pub fn set_coordinator_ready(&self, ready: bool) {
        self.inner.state.lock().coordinator_ready = ready;
    }

    /// Make the next `n` fetches, across all consumers, fail
    pub fn fail_next_fetches(&self, n: usize) {
        self.inner.state.lock().failing_fetches = n;
        self.inner.wake();
    }

    /// Consumers created so far
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections
    }

    pub fn coordinator_probes(&self) -> usize {
        self.inner.state.lock().coordinator_probes
    }

    /// Every retained record of `topic`, partition by partition
    pub fn records(&self, topic: &str) -> Vec<BrokerMessage> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .flat_map(|p| p.records.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Committed next-offset for one partition
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Drop records before `offset`, as log retention would
    pub fn truncate(&self, topic: &str, partition: i32, offset: i64) {
        let mut state = self.inner.state.lock();
        let partitions = Self::ensure_topic(&mut state, topic, self.inner.partitions);
        if let Some(log) = partitions.get_mut(partition as usize) {
            let drop = usize::try_from(offset - log.base)
                .unwrap_or(0)
                .min(log.records.len());
            log.records.drain(..drop);
            log.base += drop as i64;
        }
    }

    fn ensure_topic<'a>(
        state: &'a mut State,
        topic: &str,
        partitions: i32,
    ) -> &'a mut Vec<PartitionLog> {
        state.topics.entry(topic.to_string()).or_insert_with(|| {
            (0..partitions).map(|_| PartitionLog::default()).collect()
        })
    }

    fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as i32
    }
}

#[async_trait]
impl EventSink for MemoryBroker {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let partition = self.partition_for(key);
        {
            let mut state = self.inner.state.lock();
            if !state.available {
                return Err(BrokerError::Publish {
                    topic: topic.to_string(),
                    reason: "broker unavailable".to_string(),
                });
            }
            let partitions = Self::ensure_topic(&mut state, topic, self.inner.partitions);
            let log = &mut partitions[partition as usize];
            let offset = log.end();
            log.records.push(BrokerMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: Some(key.to_string()),
                payload,
            });
        }
        self.inner.wake();
        Ok(())
    }
}

#[async_trait]
impl ConsumerFactory for MemoryBroker {
    async fn connect(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<Box<dyn AlertConsumer>, BrokerError> {
        let mut state = self.inner.state.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("cannot connect consumer".to_string()));
        }
        state.connections += 1;

        let reset = self.inner.reset;
        let ends: Vec<(i64, i64)> = Self::ensure_topic(&mut state, topic, self.inner.partitions)
            .iter()
            .map(|log| (log.base, log.end()))
            .collect();

        let positions = ends
            .into_iter()
            .enumerate()
            .map(|(partition, (base, end))| {
                let partition = partition as i32;
                let key = (group.to_string(), topic.to_string(), partition);
                let start = match state.committed.get(&key) {
                    Some(&committed) => committed.max(base),
                    None => match reset {
                        OffsetReset::Earliest => base,
                        OffsetReset::Latest => end,
                    },
                };
                (partition, start)
            })
            .collect();

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            positions,
            next_partition: 0,
        }))
    }
}

#[async_trait]
impl BrokerAdmin for MemoryBroker {
    async fn find_coordinator(&self, group: &str) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        state.coordinator_probes += 1;
        if !state.available {
            return Err(BrokerError::Unavailable("no brokers reachable".to_string()));
        }
        if !state.coordinator_ready {
            return Err(BrokerError::CoordinatorNotReady(group.to_string()));
        }
        Ok(())
    }

    async fn committed_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<BTreeMap<i32, Option<i64>>, BrokerError> {
        let mut state = self.inner.state.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("cannot fetch offsets".to_string()));
        }
        let count = Self::ensure_topic(&mut state, topic, self.inner.partitions).len() as i32;
        Ok((0..count)
            .map(|partition| {
                let key = (group.to_string(), topic.to_string(), partition);
                (partition, state.committed.get(&key).copied())
            })
            .collect())
    }

    async fn earliest_offsets(&self, topic: &str) -> Result<BTreeMap<i32, i64>, BrokerError> {
        let mut state = self.inner.state.lock();
        if !state.available {
            return Err(BrokerError::Unavailable("cannot fetch watermarks".to_string()));
        }
        Ok(Self::ensure_topic(&mut state, topic, self.inner.partitions)
            .iter()
            .enumerate()
            .map(|(partition, log)| (partition as i32, log.base))
            .collect())
    }

    async fn commit_offsets(
        &self,
        group: &str,
        topic: &str,
        offsets: &BTreeMap<i32, i64>,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        if !state.available {
            return Err(BrokerError::Commit("broker unavailable".to_string()));
        }
        for (&partition, &offset) in offsets {
            state
                .committed
                .insert((group.to_string(), topic.to_string(), partition), offset);
        }
        Ok(())
    }
}

/// Consumer handed out by [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryConsumer {
    inner: Arc<Inner>,
    group: String,
    topic: String,
    /// Next offset to read per partition
    positions: BTreeMap<i32, i64>,
    next_partition: usize,
}

impl MemoryConsumer {
    fn poll(&mut self, state: &State) -> Option<BrokerMessage> {
        let partitions = state.topics.get(&self.topic)?;
        let count = partitions.len();

        for step in 0..count {
            let partition = (self.next_partition + step) % count;
            let position = self.positions.entry(partition as i32).or_insert(0);
            if let Some(record) = partitions[partition].get(*position) {
                *position += 1;
                self.next_partition = (partition + 1) % count;
                return Some(record.clone());
            }
        }
        None
    }
}

#[async_trait]
impl AlertConsumer for MemoryConsumer {
    async fn fetch(&mut self) -> Result<BrokerMessage, BrokerError> {
        let inner = self.inner.clone();
        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = inner.state.lock();
                if !state.available {
                    return Err(BrokerError::Fetch("connection lost".to_string()));
                }
                if state.failing_fetches > 0 {
                    state.failing_fetches -= 1;
                    return Err(BrokerError::Fetch("injected fetch failure".to_string()));
                }
                if let Some(message) = self.poll(&state) {
                    return Ok(message);
                }
            }

            notified.await;
        }
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock();
        if !state.available {
            return Err(BrokerError::Commit("broker unavailable".to_string()));
        }
        state.committed.insert(
            (self.group.clone(), message.topic.clone(), message.partition),
            message.offset + 1,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_latest_reset_skips_backlog() {
        let broker = MemoryBroker::new();
        broker.send("t", "k", b"old".to_vec()).await.unwrap();

        let mut consumer = broker.connect("g", "t").await.unwrap();
        broker.send("t", "k", b"new".to_vec()).await.unwrap();

        let message = consumer.fetch().await.unwrap();
        assert_eq!(message.payload, b"new");
        assert_eq!(message.offset, 1);
    }

    #[tokio::test]
    async fn test_earliest_reset_reads_backlog() {
        let broker = MemoryBroker::with_options(1, OffsetReset::Earliest);
        broker.send("t", "k", b"first".to_vec()).await.unwrap();

        let mut consumer = broker.connect("g", "t").await.unwrap();
        assert_eq!(consumer.fetch().await.unwrap().payload, b"first");
    }

    #[tokio::test]
    async fn test_new_consumer_resumes_from_commit() {
        let broker = MemoryBroker::with_options(1, OffsetReset::Earliest);
        for payload in [b"a", b"b", b"c"] {
            broker.send("t", "k", payload.to_vec()).await.unwrap();
        }

        let mut consumer = broker.connect("g", "t").await.unwrap();
        let first = consumer.fetch().await.unwrap();
        consumer.commit(&first).await.unwrap();
        let _uncommitted = consumer.fetch().await.unwrap();
        drop(consumer);

        assert_eq!(broker.committed("g", "t", 0), Some(1));
        let mut consumer = broker.connect("g", "t").await.unwrap();
        assert_eq!(consumer.fetch().await.unwrap().payload, b"b");
    }

    #[tokio::test]
    async fn test_fetch_waits_for_send() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.connect("g", "t").await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.send("t", "k", b"late".to_vec()).await.unwrap();
        });

        let message = tokio::time::timeout(Duration::from_secs(2), consumer.fetch())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, b"late");
    }

    #[tokio::test]
    async fn test_outage_fails_pending_fetch() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.connect("g", "t").await.unwrap();

        let toggler = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            toggler.set_available(false);
        });

        assert!(matches!(consumer.fetch().await, Err(BrokerError::Fetch(_))));
        assert!(broker.connect("g", "t").await.is_err());
        assert!(broker.send("t", "k", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let broker = MemoryBroker::with_options(4, OffsetReset::Earliest);
        for _ in 0..3 {
            broker.send("t", "BTC/USD", vec![]).await.unwrap();
        }
        let records = broker.records("t");
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.partition == records[0].partition));
        let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_truncate_moves_earliest_offset() {
        let broker = MemoryBroker::new();
        for _ in 0..5 {
            broker.send("t", "k", vec![]).await.unwrap();
        }
        broker.truncate("t", 0, 3);

        let earliest = broker.earliest_offsets("t").await.unwrap();
        assert_eq!(earliest.get(&0), Some(&3));
        assert_eq!(broker.records("t").len(), 2);
    }

    #[tokio::test]
    async fn test_admin_reports_missing_commits() {
        let broker = MemoryBroker::with_options(2, OffsetReset::Latest);
        let committed = broker.committed_offsets("g", "t").await.unwrap();
        assert_eq!(committed.len(), 2);
        assert!(committed.values().all(Option::is_none));

        broker
            .commit_offsets("g", "t", &BTreeMap::from([(1, 4)]))
            .await
            .unwrap();
        let committed = broker.committed_offsets("g", "t").await.unwrap();
        assert_eq!(committed.get(&1), Some(&Some(4)));
    }
}

//! Broker-mediated hand-off between evaluation and delivery
//!
//! The evaluator side writes alert envelopes through an [`EventSink`]; the
//! delivery side reads them through per-group [`AlertConsumer`]s created by a
//! [`ConsumerFactory`]. [`BrokerAdmin`] covers the coordinator probe and the
//! committed-offset bookkeeping used at startup.
//!
//! Two backends implement every trait:
//! - [`memory::MemoryBroker`]: in-process partitioned log, used by tests
//! - `kafka` (feature `kafka`): rdkafka producer, consumer and admin calls

pub mod backoff;
pub mod bootstrap;
pub mod events;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod publisher;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use backoff::Backoff;
pub use bootstrap::{init_group_offsets, wait_for_coordinator, GroupSpec, OffsetInit};
pub use events::{
    AlertEnvelope, MetricAlertEvent, PredictionAlertEvent, TokenAlertEvent,
    TOPIC_METRIC_ALERT, TOPIC_PREDICTION_ALERT, TOPIC_TOKEN_ALERT,
};
pub use memory::{MemoryBroker, OffsetReset};
pub use publisher::AlertPublisher;

/// One record read from a topic partition
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Producer side: append a payload to a topic
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// A consumer-group member bound to one topic
///
/// `fetch` must be cancel-safe: dropping the future before it resolves
/// must not advance the consumer's position.
#[async_trait]
pub trait AlertConsumer: Send {
    /// Wait for the next message
    async fn fetch(&mut self) -> Result<BrokerMessage, BrokerError>;

    /// Mark `message` as processed for the group
    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError>;
}

/// Creates fresh consumers; called again after every reconnect
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn connect(&self, group: &str, topic: &str)
        -> Result<Box<dyn AlertConsumer>, BrokerError>;
}

/// Group-coordination and offset management calls
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Succeeds once the group coordinator answers a lookup for `group`
    async fn find_coordinator(&self, group: &str) -> Result<(), BrokerError>;

    /// Committed position per partition, `None` where the group never committed
    async fn committed_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<BTreeMap<i32, Option<i64>>, BrokerError>;

    /// Oldest retained offset per partition
    async fn earliest_offsets(&self, topic: &str) -> Result<BTreeMap<i32, i64>, BrokerError>;

    /// Store `offsets` (next offset to read, per partition) for `group`
    async fn commit_offsets(
        &self,
        group: &str,
        topic: &str,
        offsets: &BTreeMap<i32, i64>,
    ) -> Result<(), BrokerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Group coordinator not ready for {0}")]
    CoordinatorNotReady(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Commit error: {0}")]
    Commit(String),

    #[error("Publish error on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Invalid alert envelope: {0}")]
    Envelope(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

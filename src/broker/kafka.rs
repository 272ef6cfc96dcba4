//! Kafka backend
//!
//! - [`KafkaSink`]: `FutureProducer` writing alert envelopes
//! - [`KafkaConsumerFactory`]: one `StreamConsumer` per (group, topic), auto
//!   commit disabled; offsets are committed only after delivery
//! - [`KafkaAdmin`]: coordinator probe and offset bookkeeping through
//!   short-lived `BaseConsumer`s on the blocking pool

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};

use super::events::TOPIC_TOKEN_ALERT;
use super::{AlertConsumer, BrokerAdmin, BrokerError, BrokerMessage, ConsumerFactory, EventSink};
use crate::config::KafkaConfig;

/// Producer for the alert topics
pub struct KafkaSink {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.publish_timeout.as_millis().to_string())
            .set("acks", "all")
            .create()?;

        Ok(Self {
            producer,
            timeout: config.publish_timeout,
        })
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);
        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Creates group consumers subscribed to a single topic
#[derive(Debug, Clone)]
pub struct KafkaConsumerFactory {
    config: KafkaConfig,
}

impl KafkaConsumerFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConsumerFactory for KafkaConsumerFactory {
    async fn connect(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<Box<dyn AlertConsumer>, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", group)
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .create()?;

        consumer.subscribe(&[topic])?;
        tracing::info!(group = %group, topic = %topic, "Kafka consumer subscribed");

        Ok(Box::new(KafkaAlertConsumer { consumer }))
    }
}

pub struct KafkaAlertConsumer {
    consumer: StreamConsumer,
}

#[async_trait]
impl AlertConsumer for KafkaAlertConsumer {
    async fn fetch(&mut self) -> Result<BrokerMessage, BrokerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| BrokerError::Fetch(e.to_string()))?;

        Ok(BrokerMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }
}

/// Group-coordination calls, each on a fresh `BaseConsumer`
#[derive(Debug, Clone)]
pub struct KafkaAdmin {
    config: KafkaConfig,
}

impl KafkaAdmin {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    fn client(&self, group: &str) -> Result<BaseConsumer, KafkaError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .create()
    }

    /// Run a blocking librdkafka call off the async runtime
    async fn blocking<T, F>(&self, group: &str, f: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(BaseConsumer, Duration) -> Result<T, BrokerError> + Send + 'static,
    {
        let client = self.client(group)?;
        let timeout = self.config.admin_timeout;
        tokio::task::spawn_blocking(move || f(client, timeout))
            .await
            .map_err(|e| BrokerError::Unavailable(format!("admin task failed: {}", e)))?
    }

    /// Partition ids of `topic`; a missing topic or one with no partitions is an error
    fn partitions(
        client: &BaseConsumer,
        topic: &str,
        timeout: Duration,
    ) -> Result<Vec<i32>, BrokerError> {
        let metadata = client.fetch_metadata(Some(topic), timeout)?;
        let meta = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| BrokerError::Unavailable(format!("topic {} not in metadata", topic)))?;
        if let Some(err) = meta.error() {
            return Err(BrokerError::Unavailable(format!("topic {}: {:?}", topic, err)));
        }
        let ids: Vec<i32> = meta.partitions().iter().map(|p| p.id()).collect();
        if ids.is_empty() {
            return Err(BrokerError::Unavailable(format!(
                "topic {} has no partitions",
                topic
            )));
        }
        Ok(ids)
    }
}

/// Partitions named in the coordinator probe's OffsetFetch
///
/// Any topic works; the request is routed to the group coordinator whether or
/// not the topic exists.
pub fn coordinator_probe_partitions() -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(TOPIC_TOKEN_ALERT, 0);
    tpl
}

#[async_trait]
impl BrokerAdmin for KafkaAdmin {
    async fn find_coordinator(&self, group: &str) -> Result<(), BrokerError> {
        let timeout = self.config.probe_timeout;
        self.blocking(group, move |client, _| {
            // OffsetFetch is only answered by the group's coordinator
            client
                .committed_offsets(coordinator_probe_partitions(), timeout)
                .map(|_| ())
                .map_err(BrokerError::from)
        })
        .await
        .map_err(|e| BrokerError::CoordinatorNotReady(format!("{}: {}", group, e)))
    }

    async fn committed_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<BTreeMap<i32, Option<i64>>, BrokerError> {
        let topic = topic.to_string();
        self.blocking(group, move |client, timeout| {
            let mut tpl = TopicPartitionList::new();
            for partition in Self::partitions(&client, &topic, timeout)? {
                tpl.add_partition(&topic, partition);
            }
            let committed = client.committed_offsets(tpl, timeout)?;
            if committed.count() == 0 {
                return Err(BrokerError::Unavailable(format!(
                    "no committed offsets reported for {}",
                    topic
                )));
            }
            Ok(committed
                .elements()
                .iter()
                .map(|e| {
                    let offset = match e.offset() {
                        Offset::Offset(o) if o >= 0 => Some(o),
                        _ => None,
                    };
                    (e.partition(), offset)
                })
                .collect())
        })
        .await
    }

    async fn earliest_offsets(&self, topic: &str) -> Result<BTreeMap<i32, i64>, BrokerError> {
        let topic = topic.to_string();
        let group = format!("{}-admin", self.config.group_prefix);
        self.blocking(&group, move |client, timeout| {
            let mut earliest = BTreeMap::new();
            for partition in Self::partitions(&client, &topic, timeout)? {
                let (low, _high) = client.fetch_watermarks(&topic, partition, timeout)?;
                earliest.insert(partition, low);
            }
            Ok(earliest)
        })
        .await
    }

    async fn commit_offsets(
        &self,
        group: &str,
        topic: &str,
        offsets: &BTreeMap<i32, i64>,
    ) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        for (&partition, &offset) in offsets {
            tpl.add_partition_offset(topic, partition, Offset::Offset(offset))?;
        }
        self.blocking(group, move |client, _| {
            client.commit(&tpl, CommitMode::Sync).map_err(BrokerError::from)
        })
            .await
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }
}

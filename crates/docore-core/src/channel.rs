//! Partitioned message channel.
//!
//! Producers publish [`OutgoingRecord`]s through the [`Publisher`] trait;
//! consumers take ownership of whole partitions via
//! [`InMemoryBroker::subscribe`] and acknowledge progress by committing
//! offsets. Records with the same key always land on the same partition, so
//! a single partition consumer sees them in publish order.
//!
//! [`InMemoryBroker`] is the in-process implementation used by the binary
//! and the tests. Each partition is a bounded tokio mpsc channel, so a full
//! partition applies backpressure to publishers instead of dropping records.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    future::Future,
    hash::{Hash, Hasher},
    pin::Pin,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

/// Well-known message header names.
pub mod headers {
    /// Trace id propagated from ingress.
    pub const TRACE_ID: &str = "traceId";
    /// Failure category of the last attempt.
    pub const EXCEPTION_MESSAGE: &str = "x-exception-message";
    /// Rendered error chain of the last attempt.
    pub const EXCEPTION_STACKTRACE: &str = "x-exception-stacktrace";
    /// `retryable` or `terminal`.
    pub const EXCEPTION_KIND: &str = "x-exception-kind";
    /// Topic the message was consumed from before dead-lettering.
    pub const ORIGINAL_TOPIC: &str = "x-original-topic";
    /// Partition the message was consumed from before dead-lettering.
    pub const ORIGINAL_PARTITION: &str = "x-original-partition";
    /// Offset the message had before dead-lettering.
    pub const ORIGINAL_OFFSET: &str = "x-original-offset";
    /// Number of attempts made before dead-lettering.
    pub const ATTEMPTS: &str = "x-attempts";
}

/// Result type alias using `ChannelError`.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Failures raised by the channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Topic does not exist and auto-creation is disabled.
    #[error("unknown topic {0}")]
    UnknownTopic(String),

    /// Explicit partition is out of range for the topic.
    #[error("topic {topic} has {partitions} partitions, partition {partition} requested")]
    UnknownPartition {
        /// Topic name
        topic: String,
        /// Requested partition
        partition: u32,
        /// Number of partitions the topic has
        partitions: u32,
    },

    /// Partition receivers were already handed to another consumer.
    #[error("topic {0} already has a consumer")]
    AlreadySubscribed(String),

    /// Topic was created twice with different partition counts.
    #[error("topic {topic} exists with {existing} partitions, {requested} requested")]
    PartitionMismatch {
        /// Topic name
        topic: String,
        /// Current partition count
        existing: u32,
        /// Requested partition count
        requested: u32,
    },

    /// Consumer side of the partition has gone away.
    #[error("topic {0} is closed")]
    Closed(String),
}

/// Message read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
    /// Position within the partition, starting at 0.
    pub offset: u64,
    /// Ordering key.
    pub key: Option<String>,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// String headers.
    pub headers: HashMap<String, String>,
}

impl Message {
    /// Returns a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Returns the propagated trace id, if any.
    pub fn trace_id(&self) -> Option<&str> {
        self.header(headers::TRACE_ID).filter(|id| !id.is_empty())
    }
}

/// Record handed to a [`Publisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    /// Destination topic.
    pub topic: String,
    /// Explicit partition; derived from the key when absent.
    pub partition: Option<u32>,
    /// Ordering key.
    pub key: Option<String>,
    /// Payload bytes.
    pub payload: Bytes,
    /// String headers.
    pub headers: HashMap<String, String>,
}

impl OutgoingRecord {
    /// Creates a record for `topic` with no key or headers.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    /// Sets the ordering key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Pins the record to a partition.
    #[must_use]
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds the trace id header.
    #[must_use]
    pub fn with_trace_id(self, trace_id: impl Into<String>) -> Self {
        self.with_header(headers::TRACE_ID, trace_id)
    }
}

/// Where a published record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Topic written to.
    pub topic: String,
    /// Partition written to.
    pub partition: u32,
    /// Offset assigned.
    pub offset: u64,
}

/// Write side of the channel.
pub trait Publisher: Send + Sync + std::fmt::Debug {
    /// Appends a record to its topic.
    ///
    /// Completes once the record is accepted by the partition; waits while
    /// the partition is full.
    fn publish(
        &self,
        record: OutgoingRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt>> + Send + '_>>;
}

/// Broker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Partition count for topics created on first use.
    pub default_partitions: u32,
    /// Buffered records per partition before publishers wait.
    pub partition_capacity: usize,
    /// Create unknown topics on publish/subscribe.
    pub auto_create_topics: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { default_partitions: 3, partition_capacity: 1024, auto_create_topics: true }
    }
}

#[derive(Debug)]
struct PartitionLog {
    sender: mpsc::Sender<Message>,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    // Holding this lock across the send keeps offsets in channel order.
    next_offset: Mutex<u64>,
    committed: AtomicU64,
}

impl PartitionLog {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            next_offset: Mutex::new(0),
            committed: AtomicU64::new(0),
        }
    }
}

#[derive(Debug)]
struct Topic {
    partitions: Vec<Arc<PartitionLog>>,
    round_robin: AtomicU32,
}

impl Topic {
    fn new(partitions: u32, capacity: usize) -> Self {
        Self {
            partitions: (0..partitions.max(1))
                .map(|_| Arc::new(PartitionLog::new(capacity)))
                .collect(),
            round_robin: AtomicU32::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)] // partition counts are u32
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn select_partition(&self, key: Option<&str>) -> u32 {
        let count = self.partition_count();
        match key {
            Some(key) => partition_for_key(key, count),
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        }
    }
}

/// Deterministic key-to-partition mapping.
#[allow(clippy::cast_possible_truncation)] // result is < partitions
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

/// In-process partitioned broker.
#[derive(Debug)]
pub struct InMemoryBroker {
    config: BrokerConfig,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl InMemoryBroker {
    /// Creates a broker with no topics.
    pub fn new(config: BrokerConfig) -> Self {
        Self { config, topics: RwLock::new(HashMap::new()) }
    }

    /// Creates `name` with `partitions` partitions.
    ///
    /// Creating an existing topic with the same partition count is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::PartitionMismatch` if the topic exists with a
    /// different partition count.
    pub async fn create_topic(&self, name: &str, partitions: u32) -> Result<()> {
        let mut topics = self.topics.write().await;
        if let Some(existing) = topics.get(name) {
            let existing = existing.partition_count();
            if existing != partitions.max(1) {
                return Err(ChannelError::PartitionMismatch {
                    topic: name.to_string(),
                    existing,
                    requested: partitions,
                });
            }
            return Ok(());
        }

        info!(topic = name, partitions, "creating topic");
        topics.insert(
            name.to_string(),
            Arc::new(Topic::new(partitions, self.config.partition_capacity)),
        );
        Ok(())
    }

    /// Number of partitions of `name`, if it exists.
    pub async fn partition_count(&self, name: &str) -> Option<u32> {
        self.topics.read().await.get(name).map(|t| t.partition_count())
    }

    /// Takes ownership of every partition of `topic`.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::AlreadySubscribed` if another consumer holds
    /// the partitions, or `UnknownTopic` when auto-creation is disabled.
    pub async fn subscribe(&self, topic: &str) -> Result<Vec<PartitionConsumer>> {
        let handle = self.topic(topic).await?;

        let mut consumers = Vec::with_capacity(handle.partitions.len());
        for (index, log) in handle.partitions.iter().enumerate() {
            let Some(receiver) = log.receiver.lock().await.take() else {
                return Err(ChannelError::AlreadySubscribed(topic.to_string()));
            };
            consumers.push(PartitionConsumer {
                topic: topic.to_string(),
                partition: u32::try_from(index).unwrap_or(u32::MAX),
                receiver,
                log: log.clone(),
            });
        }

        debug!(topic, partitions = consumers.len(), "subscribed to topic");
        Ok(consumers)
    }

    /// Next committed offset of a partition (offset of the first message not
    /// yet acknowledged).
    pub async fn committed_offset(&self, topic: &str, partition: u32) -> Option<u64> {
        let topics = self.topics.read().await;
        let log = topics.get(topic)?.partitions.get(partition as usize)?;
        Some(log.committed.load(Ordering::Acquire))
    }

    /// Offset the next published message on the partition will receive.
    pub async fn end_offset(&self, topic: &str, partition: u32) -> Option<u64> {
        let log = {
            let topics = self.topics.read().await;
            topics.get(topic)?.partitions.get(partition as usize)?.clone()
        };
        let next = *log.next_offset.lock().await;
        Some(next)
    }

    async fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        if let Some(topic) = self.topics.read().await.get(name) {
            return Ok(topic.clone());
        }
        if !self.config.auto_create_topics {
            return Err(ChannelError::UnknownTopic(name.to_string()));
        }

        let mut topics = self.topics.write().await;
        let topic = topics.entry(name.to_string()).or_insert_with(|| {
            info!(topic = name, partitions = self.config.default_partitions, "auto-creating topic");
            Arc::new(Topic::new(self.config.default_partitions, self.config.partition_capacity))
        });
        Ok(topic.clone())
    }

    async fn append(&self, record: OutgoingRecord) -> Result<PublishReceipt> {
        let topic = self.topic(&record.topic).await?;

        let partition = match record.partition {
            Some(partition) if partition >= topic.partition_count() => {
                return Err(ChannelError::UnknownPartition {
                    topic: record.topic,
                    partition,
                    partitions: topic.partition_count(),
                });
            },
            Some(partition) => partition,
            None => topic.select_partition(record.key.as_deref()),
        };

        let log = &topic.partitions[partition as usize];
        let mut next_offset = log.next_offset.lock().await;
        let offset = *next_offset;

        let message = Message {
            topic: record.topic.clone(),
            partition,
            offset,
            key: record.key,
            payload: record.payload,
            headers: record.headers,
        };

        log.sender.send(message).await.map_err(|_| ChannelError::Closed(record.topic.clone()))?;
        *next_offset += 1;
        drop(next_offset);

        debug!(topic = %record.topic, partition, offset, "record appended");
        Ok(PublishReceipt { topic: record.topic, partition, offset })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Publisher for InMemoryBroker {
    fn publish(
        &self,
        record: OutgoingRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt>> + Send + '_>> {
        Box::pin(self.append(record))
    }
}

/// Exclusive reader of one partition.
#[derive(Debug)]
pub struct PartitionConsumer {
    topic: String,
    partition: u32,
    receiver: mpsc::Receiver<Message>,
    log: Arc<PartitionLog>,
}

impl PartitionConsumer {
    /// Topic being consumed.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition being consumed.
    pub const fn partition(&self) -> u32 {
        self.partition
    }

    /// Waits for the next message. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Acknowledges `message` and everything before it on this partition.
    pub fn commit(&self, message: &Message) {
        self.log.committed.fetch_max(message.offset + 1, Ordering::AcqRel);
    }

    /// Next offset that has not been acknowledged.
    pub fn committed_offset(&self) -> u64 {
        self.log.committed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(partitions: u32) -> InMemoryBroker {
        InMemoryBroker::new(BrokerConfig {
            default_partitions: partitions,
            partition_capacity: 16,
            auto_create_topics: true,
        })
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition_in_order() {
        let broker = broker(4);
        let mut partitions = Vec::new();
        for i in 0..5 {
            let receipt = broker
                .publish(OutgoingRecord::new("logs", format!("{i}")).with_key("auth"))
                .await
                .unwrap();
            partitions.push(receipt.partition);
            assert_eq!(receipt.offset, i);
        }
        assert!(partitions.windows(2).all(|w| w[0] == w[1]));

        let mut consumers = broker.subscribe("logs").await.unwrap();
        let consumer = &mut consumers[partitions[0] as usize];
        for i in 0..5u64 {
            let message = consumer.recv().await.unwrap();
            assert_eq!(message.offset, i);
            assert_eq!(message.payload, Bytes::from(i.to_string()));
        }
    }

    #[tokio::test]
    async fn explicit_partition_and_headers_are_preserved() {
        let broker = broker(3);
        broker
            .publish(
                OutgoingRecord::new("logs.DLQ", "payload")
                    .with_partition(2)
                    .with_key("billing")
                    .with_trace_id("trace-1"),
            )
            .await
            .unwrap();

        let mut consumers = broker.subscribe("logs.DLQ").await.unwrap();
        let message = consumers[2].recv().await.unwrap();
        assert_eq!(message.partition, 2);
        assert_eq!(message.key.as_deref(), Some("billing"));
        assert_eq!(message.trace_id(), Some("trace-1"));
    }

    #[tokio::test]
    async fn out_of_range_partition_is_rejected() {
        let broker = broker(2);
        let err = broker
            .publish(OutgoingRecord::new("logs", "x").with_partition(5))
            .await
            .unwrap_err();

        assert_eq!(err, ChannelError::UnknownPartition {
            topic: "logs".to_string(),
            partition: 5,
            partitions: 2,
        });
    }

    #[tokio::test]
    async fn commit_advances_committed_offset() {
        let broker = broker(1);
        broker.publish(OutgoingRecord::new("logs", "a")).await.unwrap();
        broker.publish(OutgoingRecord::new("logs", "b")).await.unwrap();

        let mut consumers = broker.subscribe("logs").await.unwrap();
        let consumer = &mut consumers[0];
        let first = consumer.recv().await.unwrap();
        consumer.commit(&first);

        assert_eq!(broker.committed_offset("logs", 0).await, Some(1));
        assert_eq!(broker.end_offset("logs", 0).await, Some(2));
    }

    #[tokio::test]
    async fn second_subscription_is_refused() {
        let broker = broker(1);
        let _consumers = broker.subscribe("logs").await.unwrap();

        let err = broker.subscribe("logs").await.unwrap_err();
        assert_eq!(err, ChannelError::AlreadySubscribed("logs".to_string()));
    }

    #[tokio::test]
    async fn unknown_topic_without_auto_create() {
        let broker = InMemoryBroker::new(BrokerConfig {
            auto_create_topics: false,
            ..BrokerConfig::default()
        });

        let err = broker.publish(OutgoingRecord::new("missing", "x")).await.unwrap_err();
        assert_eq!(err, ChannelError::UnknownTopic("missing".to_string()));

        broker.create_topic("present", 2).await.unwrap();
        assert_eq!(broker.partition_count("present").await, Some(2));
        assert!(broker.create_topic("present", 3).await.is_err());
    }
}

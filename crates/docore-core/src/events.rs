//! Pipeline outcome events and subscriber fan-out.
//!
//! The delivery pipeline emits one terminal event per message (succeeded,
//! dead-lettered or skipped) plus a retry event for every scheduled retry.
//! Subscribers observe outcomes without the pipeline knowing about them.
//!
//! ```text
//! ┌─────────────────┐   PipelineEvent    ┌─────────────────────┐
//! │ DeliveryWorker  │ ─────────────────▶ │ MulticastSubscriber │
//! └─────────────────┘                    └─────────────────────┘
//!                                           │            │
//!                                           ▼            ▼
//!                                       metrics      test probes
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted by the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Handler completed successfully.
    Succeeded(MessageSucceededEvent),

    /// Attempt failed and another attempt is scheduled.
    Retrying(RetryScheduledEvent),

    /// Message was routed to the dead-letter destination.
    DeadLettered(MessageDeadLetteredEvent),

    /// Empty or null payload was acknowledged without handling.
    Skipped(MessageSkippedEvent),
}

impl PipelineEvent {
    /// Offset of the message the event is about.
    pub const fn offset(&self) -> u64 {
        match self {
            Self::Succeeded(e) => e.offset,
            Self::Retrying(e) => e.offset,
            Self::DeadLettered(e) => e.offset,
            Self::Skipped(e) => e.offset,
        }
    }
}

/// Emitted once when a message is handled successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSucceededEvent {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// Trace id from the message headers.
    pub trace_id: Option<String>,
    /// Attempt that succeeded (1-based).
    pub attempt_number: u32,
    /// When the handler returned.
    pub completed_at: DateTime<Utc>,
}

/// Emitted each time a retry is scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryScheduledEvent {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Wait before the next attempt in milliseconds.
    pub delay_ms: u64,
    /// Failure category of the attempt.
    pub failure_reason: String,
}

/// Emitted once when a message is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeadLetteredEvent {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// Dead-letter topic the message was published to.
    pub destination: String,
    /// Failure category of the last attempt.
    pub failure_reason: String,
    /// Whether the last failure was terminal rather than budget exhaustion.
    pub terminal: bool,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Trace id from the message headers.
    pub trace_id: Option<String>,
    /// When the message was routed.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Emitted when an empty or null payload is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSkippedEvent {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
}

/// Observer of pipeline outcomes.
///
/// Implementations must not fail or block for long; the worker awaits them
/// inline after each outcome.
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync + std::fmt::Debug {
    /// Receives a pipeline event.
    async fn on_event(&self, event: PipelineEvent);
}

/// Subscriber that discards everything.
#[derive(Debug, Default)]
pub struct NoOpSubscriber;

impl NoOpSubscriber {
    /// Creates a new no-op subscriber.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventSubscriber for NoOpSubscriber {
    async fn on_event(&self, _event: PipelineEvent) {}
}

/// Forwards every event to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastSubscriber {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl MulticastSubscriber {
    /// Creates a multicast subscriber with no targets.
    pub fn new() -> Self {
        Self { subscribers: Vec::new() }
    }

    /// Registers another subscriber.
    pub fn add_subscriber(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait::async_trait]
impl EventSubscriber for MulticastSubscriber {
    async fn on_event(&self, event: PipelineEvent) {
        let deliveries = self.subscribers.iter().map(|subscriber| {
            let event = event.clone();
            async move { subscriber.on_event(event).await }
        });

        futures::future::join_all(deliveries).await;
    }
}

//! Dead-letter routing.
//!
//! A message that failed terminally or ran out of attempts is republished to
//! `<source topic><suffix>` on the same partition with the same key. The
//! payload bytes are passed through untouched; failure metadata travels in
//! headers.

use std::sync::Arc;

use docore_core::{headers, Message, OutgoingRecord, PublishReceipt, Publisher};

use crate::{classify::ErrorInfo, error::Result};

/// Default suffix appended to the source topic.
pub const DEFAULT_DEAD_LETTER_SUFFIX: &str = ".DLQ";

/// Republishes failed messages to their dead-letter topic.
#[derive(Debug, Clone)]
pub struct DeadLetterRouter {
    publisher: Arc<dyn Publisher>,
    suffix: String,
}

impl DeadLetterRouter {
    /// Creates a router publishing through `publisher`.
    pub fn new(publisher: Arc<dyn Publisher>, suffix: impl Into<String>) -> Self {
        Self { publisher, suffix: suffix.into() }
    }

    /// Dead-letter topic for `topic`.
    pub fn destination(&self, topic: &str) -> String {
        format!("{topic}{}", self.suffix)
    }

    /// Publishes `message` to its dead-letter topic.
    ///
    /// Existing headers, including the trace id, are kept. Failure headers
    /// overwrite any stale values from an earlier dead-lettering.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Channel` if the publish fails.
    pub async fn route(&self, message: &Message, info: &ErrorInfo, attempts: u32) -> Result<PublishReceipt> {
        let mut record = OutgoingRecord::new(self.destination(&message.topic), message.payload.clone())
            .with_partition(message.partition);
        record.key.clone_from(&message.key);
        record.headers.clone_from(&message.headers);

        let record = record
            .with_header(headers::EXCEPTION_MESSAGE, info.reason.as_str())
            .with_header(headers::EXCEPTION_STACKTRACE, info.stack_trace.as_str())
            .with_header(headers::EXCEPTION_KIND, info.kind.to_string())
            .with_header(headers::ORIGINAL_TOPIC, message.topic.as_str())
            .with_header(headers::ORIGINAL_PARTITION, message.partition.to_string())
            .with_header(headers::ORIGINAL_OFFSET, message.offset.to_string())
            .with_header(headers::ATTEMPTS, attempts.to_string());

        let receipt = self.publisher.publish(record).await?;

        tracing::info!(
            destination = %receipt.topic,
            partition = receipt.partition,
            dlq_offset = receipt.offset,
            reason = %info.reason,
            "message dead-lettered"
        );
        Ok(receipt)
    }
}

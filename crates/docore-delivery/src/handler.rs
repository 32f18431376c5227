//! Message handlers invoked by the delivery pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use docore_core::models::LogEvent;

use crate::{
    circuit::CircuitBreaker,
    error::{DeliveryError, Result},
    storage::LogStore,
};

/// Where a message came from and which attempt this is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// Attempt number, starting at 1.
    pub attempt_number: u32,
    /// Propagated trace id, `N/A` when the producer sent none.
    pub trace_id: String,
}

/// Processes one decoded log event.
///
/// The pipeline awaits the handler inline; a returned error is classified
/// and either retried or dead-lettered. A panic is caught and treated as a
/// retryable internal failure.
#[async_trait]
pub trait MessageHandler: Send + Sync + std::fmt::Debug {
    /// Handles `event`.
    async fn handle(&self, event: &LogEvent, ctx: &DeliveryContext) -> Result<()>;
}

/// Default handler: writes the event to the log index through the breaker.
#[derive(Debug, Clone)]
pub struct StoreWriteHandler {
    store: Arc<dyn LogStore>,
    breaker: Arc<CircuitBreaker>,
}

impl StoreWriteHandler {
    /// Creates a handler writing to `store` behind `breaker`.
    pub fn new(store: Arc<dyn LogStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }
}

#[async_trait]
impl MessageHandler for StoreWriteHandler {
    async fn handle(&self, event: &LogEvent, ctx: &DeliveryContext) -> Result<()> {
        if let Some(field) = event.missing_field() {
            return Err(DeliveryError::missing_field(field));
        }

        let id = self
            .breaker
            .execute(
                || async { self.store.write(event).await.map_err(DeliveryError::from) },
                |err| match err {
                    DeliveryError::CircuitOpen { .. } => tracing::warn!(
                        trace_id = %ctx.trace_id,
                        service = %event.service_name,
                        "circuit open, log write skipped"
                    ),
                    other => tracing::error!(
                        trace_id = %ctx.trace_id,
                        error = %other,
                        "log write failed"
                    ),
                },
            )
            .await?;

        tracing::debug!(trace_id = %ctx.trace_id, document_id = %id, "log event stored");
        Ok(())
    }
}

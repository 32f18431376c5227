//! Delivery pipeline and the workers that drive it.
//!
//! Each worker owns a disjoint set of partitions and runs every message it
//! pulls to completion, retries included, before pulling the next. Retry
//! waits go through the worker's clock and race the cancellation token, so
//! shutdown never waits out a backoff.
//!
//! ```text
//! Received ─▶ Processing ─┬─▶ Succeeded ──────────────▶ commit
//!                         ├─▶ retry (wait, attempt + 1) ─┐
//!                         │          ▲                   │
//!                         │          └───────────────────┘
//!                         └─▶ DeadLettered ───────────▶ commit
//! ```

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use docore_core::{
    models::LogEvent, Clock, EventSubscriber, Message, MessageDeadLetteredEvent,
    MessageSkippedEvent, MessageSucceededEvent, PartitionConsumer, PipelineEvent,
    RetryScheduledEvent,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    classify::{ErrorInfo, FailureClassifier},
    dead_letter::DeadLetterRouter,
    error::{DeliveryError, Result},
    handler::{DeliveryContext, MessageHandler},
    retry::{GiveUpReason, RetryContext, RetryDecision, RetryPolicy},
};

/// Trace id logged for messages that arrived without one.
pub const NO_TRACE_ID: &str = "N/A";

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Upper bound on concurrent workers; never more than the partitions.
    pub worker_count: usize,

    /// Topic consumed by the workers.
    pub source_topic: String,

    /// Backoff and attempt budget.
    pub retry_policy: RetryPolicy,

    /// Appended to the source topic to name the dead-letter topic.
    pub dead_letter_suffix: String,

    /// Maximum time to wait for workers to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            source_topic: crate::DEFAULT_TOPIC.to_string(),
            retry_policy: RetryPolicy::default(),
            dead_letter_suffix: crate::dead_letter::DEFAULT_DEAD_LETTER_SUFFIX.to_string(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of running workers.
    pub active_workers: usize,
    /// Messages pulled from the source topic.
    pub messages_received: u64,
    /// Messages the handler accepted.
    pub messages_succeeded: u64,
    /// Retries scheduled after a failed attempt.
    pub retries_scheduled: u64,
    /// Messages routed to the dead-letter topic.
    pub messages_dead_lettered: u64,
    /// Empty or null payloads acknowledged without handling.
    pub messages_skipped: u64,
    /// Dead-letter publishes that failed.
    pub dead_letter_failures: u64,
    /// Messages currently being processed.
    pub in_flight_messages: u64,
}

/// One dequeued message and the state of its current attempt.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt<'a> {
    /// Message being delivered.
    pub message: &'a Message,
    /// Attempt number, starting at 1.
    pub attempt_number: u32,
    /// Failure of the previous attempt, if any.
    pub last_error: Option<ErrorInfo>,
}

/// How processing of one message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler accepted the event.
    Succeeded,
    /// Message was routed to the dead-letter topic.
    DeadLettered,
    /// Empty or null payload, never handed to the handler.
    Skipped,
    /// Shutdown interrupted a retry wait; the message stays unacknowledged.
    Abandoned,
    /// Shutdown interrupted dead-letter publish retries; the message stays
    /// unacknowledged.
    DeadLetterFailed,
}

impl Outcome {
    /// Whether the source offset may be committed.
    pub const fn is_acknowledged(self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered | Self::Skipped)
    }
}

/// Retry, classification and dead-letter logic shared by all workers.
#[derive(Debug)]
pub struct Pipeline {
    handler: Arc<dyn MessageHandler>,
    classifier: Arc<dyn FailureClassifier>,
    router: DeadLetterRouter,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSubscriber>,
    stats: Arc<RwLock<EngineStats>>,
}

impl Pipeline {
    /// Creates a pipeline.
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        classifier: Arc<dyn FailureClassifier>,
        router: DeadLetterRouter,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSubscriber>,
        stats: Arc<RwLock<EngineStats>>,
    ) -> Self {
        Self { handler, classifier, router, policy, clock, events, stats }
    }

    /// Runs `message` through decode, handler, retries and dead-lettering.
    ///
    /// Never fails: every error ends in one of the [`Outcome`]s.
    pub async fn process(&self, message: &Message, token: &CancellationToken) -> Outcome {
        let trace_id = message.trace_id().unwrap_or(NO_TRACE_ID).to_string();
        let span = info_span!(
            "deliver",
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            trace_id = %trace_id,
        );

        async {
            {
                let mut stats = self.stats.write().await;
                stats.messages_received += 1;
                stats.in_flight_messages += 1;
            }

            let outcome = self.run(message, trace_id.clone(), token).await;

            self.stats.write().await.in_flight_messages -= 1;
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run(&self, message: &Message, trace_id: String, token: &CancellationToken) -> Outcome {
        let decoded = match LogEvent::from_payload(&message.payload) {
            Ok(Some(event)) => Ok(event),
            Ok(None) => {
                warn!("received empty or null log event, skipping");
                self.stats.write().await.messages_skipped += 1;
                self.events
                    .on_event(PipelineEvent::Skipped(MessageSkippedEvent {
                        topic: message.topic.clone(),
                        partition: message.partition,
                        offset: message.offset,
                    }))
                    .await;
                return Outcome::Skipped;
            },
            Err(err) => Err(DeliveryError::from(err)),
        };

        let mut attempt = DeliveryAttempt { message, attempt_number: 1, last_error: None };
        let mut ctx = DeliveryContext {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            attempt_number: 1,
            trace_id,
        };

        loop {
            ctx.attempt_number = attempt.attempt_number;
            let result = match &decoded {
                Ok(event) => self.invoke(event, &ctx).await,
                Err(err) => Err(err.clone()),
            };

            let error = match result {
                Ok(()) => return self.succeed(&attempt).await,
                Err(error) => error,
            };

            let kind = self.classifier.classify(&error);
            let info = ErrorInfo::from_error(&error, kind);

            match RetryContext::new(attempt.attempt_number, kind, &self.policy).decide() {
                RetryDecision::Retry { delay } => {
                    warn!(
                        attempt_number = attempt.attempt_number,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %info.reason,
                        error = %error,
                        "delivery attempt failed, retrying"
                    );
                    self.stats.write().await.retries_scheduled += 1;
                    self.events
                        .on_event(PipelineEvent::Retrying(RetryScheduledEvent {
                            topic: message.topic.clone(),
                            partition: message.partition,
                            offset: message.offset,
                            attempt_number: attempt.attempt_number,
                            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            failure_reason: info.reason.clone(),
                        }))
                        .await;

                    attempt.last_error = Some(info);

                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            info!(
                                attempt_number = attempt.attempt_number,
                                "shutdown during retry wait, leaving message unacknowledged"
                            );
                            return Outcome::Abandoned;
                        }
                        () = self.clock.sleep(delay) => {},
                    }
                    attempt.attempt_number += 1;
                },
                RetryDecision::GiveUp { reason } => {
                    attempt.last_error = Some(info);
                    return self.dead_letter(&attempt, reason, &ctx.trace_id, token).await;
                },
            }
        }
    }

    /// Awaits the handler, turning a panic into a retryable failure.
    async fn invoke(&self, event: &LogEvent, ctx: &DeliveryContext) -> Result<()> {
        match AssertUnwindSafe(self.handler.handle(event, ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(attempt_number = ctx.attempt_number, panic = %message, "handler panicked");
                Err(DeliveryError::internal(format!("handler panicked: {message}")))
            },
        }
    }

    async fn succeed(&self, attempt: &DeliveryAttempt<'_>) -> Outcome {
        debug!(attempt_number = attempt.attempt_number, "message delivered");
        self.stats.write().await.messages_succeeded += 1;

        let message = attempt.message;
        self.events
            .on_event(PipelineEvent::Succeeded(MessageSucceededEvent {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                trace_id: message.trace_id().map(str::to_string),
                attempt_number: attempt.attempt_number,
                completed_at: self.clock.now_utc(),
            }))
            .await;
        Outcome::Succeeded
    }

    async fn dead_letter(
        &self,
        attempt: &DeliveryAttempt<'_>,
        reason: GiveUpReason,
        trace_id: &str,
        token: &CancellationToken,
    ) -> Outcome {
        let message = attempt.message;
        let Some(info) = attempt.last_error.as_ref() else {
            return Outcome::DeadLetterFailed;
        };

        match reason {
            GiveUpReason::Terminal => warn!(
                trace_id,
                reason = %info.reason,
                "terminal failure, dead-lettering without retry"
            ),
            GiveUpReason::Exhausted { attempts } => warn!(
                trace_id,
                attempts,
                reason = %info.reason,
                "retries exhausted, dead-lettering"
            ),
        }

        // The source offset is only committed once the dead letter is
        // accepted, so a failing publish holds the partition until it
        // succeeds or shutdown starts.
        let mut publish_attempt: u32 = 1;
        loop {
            match self.router.route(message, info, attempt.attempt_number).await {
                Ok(receipt) => {
                    self.stats.write().await.messages_dead_lettered += 1;
                    self.events
                        .on_event(PipelineEvent::DeadLettered(MessageDeadLetteredEvent {
                            topic: message.topic.clone(),
                            partition: message.partition,
                            offset: message.offset,
                            destination: receipt.topic,
                            failure_reason: info.reason.clone(),
                            terminal: matches!(reason, GiveUpReason::Terminal),
                            attempts: attempt.attempt_number,
                            trace_id: message.trace_id().map(str::to_string),
                            dead_lettered_at: self.clock.now_utc(),
                        }))
                        .await;
                    return Outcome::DeadLettered;
                },
                Err(err) => {
                    self.stats.write().await.dead_letter_failures += 1;
                    let delay = self.policy.delay(publish_attempt);
                    error!(
                        trace_id,
                        publish_attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "dead-letter publish failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            warn!(trace_id, "shutdown during dead-letter retry, leaving message unacknowledged");
                            return Outcome::DeadLetterFailed;
                        }
                        () = self.clock.sleep(delay) => {},
                    }
                    publish_attempt = publish_attempt.saturating_add(1);
                },
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Worker owning a set of partitions.
#[derive(Debug)]
pub struct DeliveryWorker {
    id: usize,
    consumers: Vec<PartitionConsumer>,
    pipeline: Arc<Pipeline>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Creates a worker for `consumers`.
    pub fn new(
        id: usize,
        consumers: Vec<PartitionConsumer>,
        pipeline: Arc<Pipeline>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, consumers, pipeline, cancellation_token }
    }

    /// Worker identifier.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Partitions owned by this worker.
    pub fn partitions(&self) -> Vec<u32> {
        self.consumers.iter().map(PartitionConsumer::partition).collect()
    }

    /// Pulls and processes messages until cancelled.
    ///
    /// # Errors
    ///
    /// Currently never returns an error; per-message failures end in an
    /// [`Outcome`].
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = self.id, partitions = ?self.partitions(), "delivery worker starting");

        while !self.consumers.is_empty() {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            let received = {
                let receives = self
                    .consumers
                    .iter_mut()
                    .enumerate()
                    .map(|(index, consumer)| Box::pin(async move { (index, consumer.recv().await) }));

                tokio::select! {
                    ((index, message), _, _) = futures::future::select_all(receives) => Some((index, message)),
                    () = self.cancellation_token.cancelled() => None,
                }
            };

            let Some((index, message)) = received else {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            };

            let Some(message) = message else {
                let closed = self.consumers.remove(index);
                warn!(worker_id = self.id, partition = closed.partition(), "partition closed");
                continue;
            };

            let outcome = self.pipeline.process(&message, &self.cancellation_token).await;
            if !outcome.is_acknowledged() {
                // Committing a later offset would skip this message.
                warn!(
                    worker_id = self.id,
                    partition = message.partition,
                    offset = message.offset,
                    ?outcome,
                    "message left unacknowledged, worker stopping"
                );
                break;
            }
            self.consumers[index].commit(&message);
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }
}

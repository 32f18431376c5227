//! Delivery pipeline behavior: retries, classification, dead-lettering and
//! the breaker in front of the store.
//!
//! Every test drives the pipeline with a `TestClock`, so backoff waits are
//! recorded rather than slept.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use docore_core::{
    channel, headers, models::LogEvent, BrokerConfig, ChannelError, CoreError, EventSubscriber,
    InMemoryBroker, Message, OutgoingRecord, PipelineEvent, PublishReceipt, Publisher, TestClock,
};
use docore_delivery::{
    circuit::{CircuitBreaker, CircuitConfig},
    classify::{DefaultClassifier, ErrorInfo},
    dead_letter::DeadLetterRouter,
    handler::{DeliveryContext, MessageHandler, StoreWriteHandler},
    retry::RetryPolicy,
    sink::ErrorRecordSink,
    storage::memory::{InMemoryErrorLogStore, InMemoryLogStore},
    worker::Pipeline,
    DeliveryError, EngineStats, Outcome, Result,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "docore-logs";
const DLQ: &str = "docore-logs.DLQ";

#[derive(Debug, Default)]
struct RecordingSubscriber {
    events: Mutex<Vec<PipelineEvent>>,
}

#[async_trait]
impl EventSubscriber for RecordingSubscriber {
    async fn on_event(&self, event: PipelineEvent) {
        self.events.lock().await.push(event);
    }
}

/// Fails the first `failures` calls with `error`, then succeeds.
#[derive(Debug)]
struct ScriptedHandler {
    failures: u32,
    error: DeliveryError,
    calls: AtomicU32,
}

impl ScriptedHandler {
    fn new(failures: u32, error: DeliveryError) -> Self {
        Self { failures, error, calls: AtomicU32::new(0) }
    }

    fn succeeding() -> Self {
        Self::new(0, DeliveryError::internal("unused"))
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, _event: &LogEvent, _ctx: &DeliveryContext) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct PanicOnceHandler {
    calls: AtomicU32,
}

#[async_trait]
impl MessageHandler for PanicOnceHandler {
    async fn handle(&self, _event: &LogEvent, _ctx: &DeliveryContext) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("index out of bounds");
        }
        Ok(())
    }
}

/// Rejects the first `failures` publishes, then forwards to the broker.
///
/// When `cancel_at` is set, the token is cancelled on that call.
#[derive(Debug)]
struct FlakyPublisher {
    broker: Arc<InMemoryBroker>,
    failures: u32,
    calls: AtomicU32,
    cancel_at: Option<(u32, CancellationToken)>,
}

impl FlakyPublisher {
    fn new(broker: Arc<InMemoryBroker>, failures: u32) -> Self {
        Self { broker, failures, calls: AtomicU32::new(0), cancel_at: None }
    }

    fn cancelling_at(mut self, call: u32, token: CancellationToken) -> Self {
        self.cancel_at = Some((call, token));
        self
    }
}

impl Publisher for FlakyPublisher {
    fn publish(
        &self,
        record: OutgoingRecord,
    ) -> Pin<Box<dyn Future<Output = channel::Result<PublishReceipt>> + Send + '_>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((at, token)) = &self.cancel_at {
                if call >= *at {
                    token.cancel();
                }
            }
            if call <= self.failures {
                return Err(ChannelError::Closed(record.topic));
            }
            self.broker.publish(record).await
        })
    }
}

struct Fixture {
    broker: Arc<InMemoryBroker>,
    clock: TestClock,
    events: Arc<RecordingSubscriber>,
    stats: Arc<RwLock<EngineStats>>,
}

impl Fixture {
    async fn new() -> Self {
        let broker = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
        broker.create_topic(TOPIC, 3).await.unwrap();
        broker.create_topic(DLQ, 3).await.unwrap();

        Self {
            broker,
            clock: TestClock::new(),
            events: Arc::new(RecordingSubscriber::default()),
            stats: Arc::new(RwLock::new(EngineStats::default())),
        }
    }

    fn pipeline(&self, handler: Arc<dyn MessageHandler>, policy: RetryPolicy) -> Pipeline {
        self.pipeline_publishing_to(handler, policy, self.broker.clone())
    }

    fn pipeline_publishing_to(
        &self,
        handler: Arc<dyn MessageHandler>,
        policy: RetryPolicy,
        publisher: Arc<dyn Publisher>,
    ) -> Pipeline {
        Pipeline::new(
            handler,
            Arc::new(DefaultClassifier::new()),
            DeadLetterRouter::new(publisher, ".DLQ"),
            policy,
            Arc::new(self.clock.clone()),
            self.events.clone(),
            self.stats.clone(),
        )
    }

    async fn dead_letters(&self) -> u64 {
        let mut total = 0;
        for partition in 0..3 {
            total += self.broker.end_offset(DLQ, partition).await.unwrap();
        }
        total
    }

    async fn events(&self) -> Vec<PipelineEvent> {
        self.events.events.lock().await.clone()
    }
}

fn message(payload: impl Into<Bytes>) -> Message {
    Message {
        topic: TOPIC.to_string(),
        partition: 1,
        offset: 42,
        key: Some("auth".to_string()),
        payload: payload.into(),
        headers: HashMap::from([(headers::TRACE_ID.to_string(), "trace-abc".to_string())]),
    }
}

fn event_message(event: &LogEvent) -> Message {
    message(event.to_payload().unwrap())
}

fn default_policy() -> RetryPolicy {
    RetryPolicy::fixed(3, Duration::from_secs(1))
}

#[tokio::test]
async fn first_try_success_produces_one_outcome_and_no_dead_letter() {
    let fx = Fixture::new().await;
    let handler = Arc::new(ScriptedHandler::succeeding());
    let pipeline = fx.pipeline(handler.clone(), default_policy());

    let outcome = pipeline
        .process(&event_message(&LogEvent::new("auth", "INFO", "login")), &CancellationToken::new())
        .await;

    assert_eq!(outcome, Outcome::Succeeded);
    assert_eq!(handler.calls(), 1);
    assert_eq!(fx.dead_letters().await, 0);

    let events = fx.events().await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        PipelineEvent::Succeeded(e) => {
            assert_eq!(e.attempt_number, 1);
            assert_eq!(e.trace_id.as_deref(), Some("trace-abc"));
        },
        other => panic!("expected success event, got {other:?}"),
    }
}

#[tokio::test]
async fn terminal_failure_is_dead_lettered_without_waiting() {
    let fx = Fixture::new().await;
    let handler = Arc::new(ScriptedHandler::new(u32::MAX, DeliveryError::invalid_argument("bad level")));
    let pipeline = fx.pipeline(handler.clone(), default_policy());

    let outcome = pipeline
        .process(&event_message(&LogEvent::new("auth", "LOUD", "x")), &CancellationToken::new())
        .await;

    assert_eq!(outcome, Outcome::DeadLettered);
    assert_eq!(handler.calls(), 1);
    assert_eq!(fx.clock.elapsed(), Duration::ZERO);
    assert_eq!(fx.dead_letters().await, 1);

    let events = fx.events().await;
    match events.last().unwrap() {
        PipelineEvent::DeadLettered(e) => {
            assert!(e.terminal);
            assert_eq!(e.attempts, 1);
            assert_eq!(e.failure_reason, "InvalidArgument");
            assert_eq!(e.destination, DLQ);
        },
        other => panic!("expected dead-letter event, got {other:?}"),
    }
}

#[tokio::test]
async fn retryable_failure_exhausts_budget_then_dead_letters_original_bytes() {
    let fx = Fixture::new().await;
    let handler =
        Arc::new(ScriptedHandler::new(u32::MAX, DeliveryError::store_unavailable("connection refused")));
    let pipeline = fx.pipeline(handler.clone(), default_policy());
    let original = LogEvent::new("billing", "ERROR", "card declined").with_status_code("402");
    let source = event_message(&original);

    let outcome = pipeline.process(&source, &CancellationToken::new()).await;

    assert_eq!(outcome, Outcome::DeadLettered);
    assert_eq!(handler.calls(), 3);
    assert!(fx.clock.elapsed() >= Duration::from_secs(2));

    let mut consumers = fx.broker.subscribe(DLQ).await.unwrap();
    let dead = consumers[1].recv().await.unwrap();
    assert_eq!(dead.payload, source.payload);
    assert_eq!(dead.key.as_deref(), Some("auth"));
    assert_eq!(LogEvent::from_payload(&dead.payload).unwrap(), Some(original));
    assert_eq!(dead.header(headers::ATTEMPTS), Some("3"));
    assert_eq!(dead.header(headers::EXCEPTION_MESSAGE), Some("TransientDependencyFailure"));
    assert_eq!(dead.trace_id(), Some("trace-abc"));

    let retries = fx
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::Retrying(_)))
        .count();
    assert_eq!(retries, 2);
    assert_eq!(fx.stats.read().await.retries_scheduled, 2);
}

#[tokio::test]
async fn transient_store_failures_recover_without_dead_letter() {
    let fx = Fixture::new().await;
    let store = InMemoryLogStore::new();
    store.fail_next(2, CoreError::Unavailable("503 Service Unavailable".into())).await;
    let breaker = Arc::new(CircuitBreaker::new(
        "log-store",
        CircuitConfig::default(),
        Arc::new(fx.clock.clone()),
    ));
    let handler = Arc::new(StoreWriteHandler::new(Arc::new(store.clone()), breaker));
    let pipeline = fx.pipeline(handler, default_policy());

    let outcome = pipeline
        .process(&event_message(&LogEvent::new("auth", "ERROR", "boom")), &CancellationToken::new())
        .await;

    assert_eq!(outcome, Outcome::Succeeded);
    assert_eq!(store.write_attempts(), 3);
    assert_eq!(fx.dead_letters().await, 0);

    let documents = store.documents().await;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].1.message, "boom");
}

#[tokio::test]
async fn malformed_payload_becomes_malformed_message_error_record() {
    let fx = Fixture::new().await;
    let handler = Arc::new(ScriptedHandler::succeeding());
    let pipeline = fx.pipeline(handler.clone(), default_policy());

    let outcome = pipeline.process(&message(&b"{\"serviceName\": oops"[..]), &CancellationToken::new()).await;

    assert_eq!(outcome, Outcome::DeadLettered);
    assert_eq!(handler.calls(), 0);
    assert_eq!(fx.stats.read().await.retries_scheduled, 0);

    let mut consumers = fx.broker.subscribe(DLQ).await.unwrap();
    let dead = consumers[1].recv().await.unwrap();

    let errors = InMemoryErrorLogStore::new();
    let sink = ErrorRecordSink::new(Arc::new(errors.clone()), Arc::new(fx.clock.clone()));
    sink.record(&dead, &ErrorInfo::from_headers(&dead)).await.unwrap();

    let records = errors.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_reason, "MalformedMessage");
    assert_eq!(records[0].original_payload, "{\"serviceName\": oops");
    assert_eq!(records[0].trace_id.as_deref(), Some("trace-abc"));
}

#[tokio::test]
async fn open_breaker_rejects_sixth_write_without_touching_store() {
    let fx = Fixture::new().await;
    let store = InMemoryLogStore::new();
    store.fail_always(CoreError::Unavailable("connection refused".into())).await;
    let breaker = Arc::new(CircuitBreaker::new(
        "log-store",
        CircuitConfig {
            failure_threshold: 5,
            window: Duration::from_secs(10),
            ..CircuitConfig::default()
        },
        Arc::new(fx.clock.clone()),
    ));
    let handler = Arc::new(StoreWriteHandler::new(Arc::new(store.clone()), breaker));
    let pipeline = fx.pipeline(handler, RetryPolicy::fixed(1, Duration::from_secs(1)));
    let token = CancellationToken::new();

    for i in 0..5 {
        let event = LogEvent::new("auth", "ERROR", format!("failure {i}"));
        assert_eq!(pipeline.process(&event_message(&event), &token).await, Outcome::DeadLettered);
    }
    assert_eq!(store.write_attempts(), 5);

    let sixth = LogEvent::new("auth", "ERROR", "failure 5");
    assert_eq!(pipeline.process(&event_message(&sixth), &token).await, Outcome::DeadLettered);
    assert_eq!(store.write_attempts(), 5);

    match fx.events().await.last().unwrap() {
        PipelineEvent::DeadLettered(e) => assert_eq!(e.failure_reason, "CircuitOpenRejection"),
        other => panic!("expected dead-letter event, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_and_null_payloads_are_skipped() {
    let fx = Fixture::new().await;
    let handler = Arc::new(ScriptedHandler::succeeding());
    let pipeline = fx.pipeline(handler.clone(), default_policy());
    let token = CancellationToken::new();

    assert_eq!(pipeline.process(&message(Bytes::new()), &token).await, Outcome::Skipped);
    assert_eq!(pipeline.process(&message(&b"null"[..]), &token).await, Outcome::Skipped);

    assert_eq!(handler.calls(), 0);
    assert_eq!(fx.dead_letters().await, 0);
    assert_eq!(fx.stats.read().await.messages_skipped, 2);
}

#[tokio::test]
async fn handler_panic_is_retried_as_internal_failure() {
    let fx = Fixture::new().await;
    let handler = Arc::new(PanicOnceHandler::default());
    let pipeline = fx.pipeline(handler.clone(), default_policy());

    let outcome = pipeline
        .process(&event_message(&LogEvent::new("auth", "INFO", "x")), &CancellationToken::new())
        .await;

    assert_eq!(outcome, Outcome::Succeeded);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    let events = fx.events().await;
    match &events[0] {
        PipelineEvent::Retrying(e) => assert_eq!(e.failure_reason, "Internal"),
        other => panic!("expected retry event, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_interrupts_retry_wait_and_leaves_message_unacknowledged() {
    let fx = Fixture::new().await;
    let handler = Arc::new(ScriptedHandler::new(u32::MAX, DeliveryError::timeout(5_000)));
    let pipeline = fx.pipeline(handler.clone(), RetryPolicy::fixed(3, Duration::from_secs(60)));
    let token = CancellationToken::new();
    token.cancel();

    let outcome = pipeline.process(&event_message(&LogEvent::new("auth", "INFO", "x")), &token).await;

    assert_eq!(outcome, Outcome::Abandoned);
    assert!(!outcome.is_acknowledged());
    assert_eq!(handler.calls(), 1);
    assert_eq!(fx.dead_letters().await, 0);
}

#[tokio::test]
async fn missing_trace_id_still_delivers() {
    let fx = Fixture::new().await;
    let handler = Arc::new(ScriptedHandler::succeeding());
    let pipeline = fx.pipeline(handler, default_policy());
    let mut untraced = event_message(&LogEvent::new("auth", "INFO", "x"));
    untraced.headers.clear();

    assert_eq!(pipeline.process(&untraced, &CancellationToken::new()).await, Outcome::Succeeded);

    match &fx.events().await[0] {
        PipelineEvent::Succeeded(e) => assert_eq!(e.trace_id, None),
        other => panic!("expected success event, got {other:?}"),
    }
    assert_eq!(fx.stats.read().await.messages_succeeded, 1);
}

#[tokio::test]
async fn failed_dead_letter_publish_is_retried_until_accepted() {
    let fx = Fixture::new().await;
    let handler = Arc::new(ScriptedHandler::new(u32::MAX, DeliveryError::invalid_argument("bad level")));
    let publisher = Arc::new(FlakyPublisher::new(fx.broker.clone(), 2));
    let pipeline = fx.pipeline_publishing_to(handler.clone(), default_policy(), publisher.clone());

    let outcome = pipeline
        .process(&event_message(&LogEvent::new("auth", "LOUD", "x")), &CancellationToken::new())
        .await;

    assert_eq!(outcome, Outcome::DeadLettered);
    assert!(outcome.is_acknowledged());
    assert_eq!(handler.calls(), 1);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
    assert_eq!(fx.dead_letters().await, 1);
    assert_eq!(fx.clock.elapsed(), Duration::from_secs(2));

    let stats = fx.stats.read().await;
    assert_eq!(stats.dead_letter_failures, 2);
    assert_eq!(stats.messages_dead_lettered, 1);
}

#[tokio::test]
async fn shutdown_during_dead_letter_retries_leaves_message_unacknowledged() {
    let fx = Fixture::new().await;
    let token = CancellationToken::new();
    let handler = Arc::new(ScriptedHandler::new(u32::MAX, DeliveryError::invalid_argument("bad level")));
    let publisher =
        Arc::new(FlakyPublisher::new(fx.broker.clone(), u32::MAX).cancelling_at(3, token.clone()));
    let pipeline = fx.pipeline_publishing_to(handler, default_policy(), publisher.clone());

    let outcome = pipeline.process(&event_message(&LogEvent::new("auth", "LOUD", "x")), &token).await;

    assert_eq!(outcome, Outcome::DeadLetterFailed);
    assert!(!outcome.is_acknowledged());
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
    assert_eq!(fx.dead_letters().await, 0);
    assert_eq!(fx.stats.read().await.dead_letter_failures, 3);
    assert!(fx.events().await.iter().all(|e| !matches!(e, PipelineEvent::DeadLettered(_))));
}

#[tokio::test]
async fn cancelled_token_wins_over_an_elapsed_retry_wait() {
    let fx = Fixture::new().await;
    let handler = Arc::new(ScriptedHandler::new(u32::MAX, DeliveryError::timeout(5_000)));
    let pipeline = fx.pipeline(handler.clone(), RetryPolicy::fixed(5, Duration::ZERO));
    let token = CancellationToken::new();
    token.cancel();

    for _ in 0..20 {
        let outcome = pipeline.process(&event_message(&LogEvent::new("auth", "INFO", "x")), &token).await;
        assert_eq!(outcome, Outcome::Abandoned);
    }
    assert_eq!(handler.calls(), 20);
}

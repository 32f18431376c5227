//! Error record sink and the dead-letter listener feeding it.
//!
//! The listener consumes the dead-letter topic and turns every message into
//! a persisted [`ErrorLog`]. A failed save is logged and the message is
//! still acknowledged; sink failures never re-enter the retry pipeline.

use std::{sync::Arc, time::Duration};

use docore_core::{
    models::{ErrorLog, ErrorLogId},
    Clock, InMemoryBroker, Message, PartitionConsumer,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    classify::ErrorInfo,
    error::{DeliveryError, Result},
    storage::ErrorLogStore,
    worker::NO_TRACE_ID,
};

/// Persists dead-lettered messages to the error index.
#[derive(Debug, Clone)]
pub struct ErrorRecordSink {
    store: Arc<dyn ErrorLogStore>,
    clock: Arc<dyn Clock>,
}

impl ErrorRecordSink {
    /// Creates a sink writing to `store`.
    pub fn new(store: Arc<dyn ErrorLogStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Converts `message` into a failure record and saves it.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::PersistenceFailed` if the store rejects the
    /// record. The failure is already logged.
    pub async fn record(&self, message: &Message, info: &ErrorInfo) -> Result<ErrorLogId> {
        let record = ErrorLog {
            id: ErrorLogId::new(),
            original_payload: String::from_utf8_lossy(&message.payload).into_owned(),
            failure_reason: info.reason.clone(),
            stack_trace: info.stack_trace.clone(),
            trace_id: message.trace_id().map(str::to_string),
            timestamp: self.clock.now_utc(),
        };

        match self.store.save(record).await {
            Ok(id) => {
                info!(
                    error_log_id = %id,
                    trace_id = message.trace_id().unwrap_or(NO_TRACE_ID),
                    reason = %info.reason,
                    "error record saved"
                );
                Ok(id)
            },
            Err(err) => {
                error!(
                    trace_id = message.trace_id().unwrap_or(NO_TRACE_ID),
                    error = %err,
                    "failed to save error record"
                );
                Err(DeliveryError::persistence(err.to_string()))
            },
        }
    }
}

/// Consumer of a dead-letter topic.
///
/// Runs one task per partition until cancelled.
#[derive(Debug)]
pub struct DeadLetterListener {
    handles: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl DeadLetterListener {
    /// Subscribes to `topic` and starts recording its messages.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Channel` if the topic cannot be subscribed.
    pub async fn start(
        broker: &InMemoryBroker,
        topic: &str,
        sink: Arc<ErrorRecordSink>,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        let consumers = broker.subscribe(topic).await?;
        info!(topic, partitions = consumers.len(), "dead-letter listener starting");

        let handles = consumers
            .into_iter()
            .map(|consumer| tokio::spawn(listen(consumer, sink.clone(), cancellation_token.clone())))
            .collect();

        Ok(Self { handles, cancellation_token })
    }

    /// Stops every partition task and waits up to `timeout` for them.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if a task is still recording
    /// when the timeout expires.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<()> {
        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.handles);

        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(join_error) = result {
                        warn!(error = %join_error, "dead-letter task ended abnormally");
                    }
                }
                info!("dead-letter listener stopped");
                Ok(())
            },
            Err(_) => Err(DeliveryError::ShutdownTimeout { timeout }),
        }
    }
}

impl Drop for DeadLetterListener {
    fn drop(&mut self) {
        if self.handles.iter().any(|h| !h.is_finished()) {
            self.cancellation_token.cancel();
        }
    }
}

async fn listen(mut consumer: PartitionConsumer, sink: Arc<ErrorRecordSink>, token: CancellationToken) {
    loop {
        // Queued dead letters are recorded before cancellation is honored.
        let message = tokio::select! {
            biased;
            message = consumer.recv() => message,
            () = token.cancelled() => break,
        };

        let Some(message) = message else {
            debug!(topic = consumer.topic(), partition = consumer.partition(), "partition closed");
            break;
        };

        let info = ErrorInfo::from_headers(&message);
        warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            trace_id = message.trace_id().unwrap_or(NO_TRACE_ID),
            reason = %info.reason,
            "received dead-lettered message"
        );

        // Logged inside the sink; the message is acknowledged either way.
        let _ = sink.record(&message, &info).await;
        consumer.commit(&message);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use bytes::Bytes;
    use docore_core::{headers, BrokerConfig, CoreError, OutgoingRecord, Publisher, TestClock};

    use super::*;
    use crate::{classify::FailureKind, storage::memory::InMemoryErrorLogStore};

    fn dead_message() -> Message {
        Message {
            topic: "docore-logs.DLQ".to_string(),
            partition: 0,
            offset: 3,
            key: None,
            payload: Bytes::from_static(b"{oops"),
            headers: std::collections::HashMap::new(),
        }
    }

    fn info() -> ErrorInfo {
        ErrorInfo {
            kind: FailureKind::Terminal,
            reason: "MalformedMessage".to_string(),
            stack_trace: "malformed payload: eof".to_string(),
        }
    }

    #[tokio::test]
    async fn record_copies_payload_and_reason() {
        let store = InMemoryErrorLogStore::new();
        let start = UNIX_EPOCH + Duration::from_secs(1_714_557_600);
        let clock = TestClock::with_start_time(start);
        let sink = ErrorRecordSink::new(Arc::new(store.clone()), Arc::new(clock));

        sink.record(&dead_message(), &info()).await.unwrap();

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_payload, "{oops");
        assert_eq!(records[0].failure_reason, "MalformedMessage");
        assert_eq!(records[0].trace_id, None);
        assert_eq!(SystemTime::from(records[0].timestamp), start);
    }

    #[tokio::test]
    async fn shutdown_records_queued_dead_letters_first() {
        let broker = InMemoryBroker::new(BrokerConfig::default());
        broker.create_topic("docore-logs.DLQ", 2).await.unwrap();
        for i in 0..50 {
            let record = OutgoingRecord::new("docore-logs.DLQ", format!("{{\"n\":{i}}}"))
                .with_header(headers::EXCEPTION_MESSAGE, "TransientDependencyFailure");
            broker.publish(record).await.unwrap();
        }

        let store = InMemoryErrorLogStore::new();
        let sink = Arc::new(ErrorRecordSink::new(Arc::new(store.clone()), Arc::new(TestClock::new())));
        let listener = DeadLetterListener::start(&broker, "docore-logs.DLQ", sink, CancellationToken::new())
            .await
            .unwrap();
        listener.shutdown(Duration::from_secs(5)).await.unwrap();

        let records = store.records().await;
        assert_eq!(records.len(), 50);
        assert!(records.iter().all(|r| r.failure_reason == "TransientDependencyFailure"));
        let committed = broker.committed_offset("docore-logs.DLQ", 0).await.unwrap()
            + broker.committed_offset("docore-logs.DLQ", 1).await.unwrap();
        assert_eq!(committed, 50);
    }

    #[tokio::test]
    async fn store_failure_becomes_persistence_error() {
        let store = InMemoryErrorLogStore::new();
        store.fail_next(1, CoreError::Unavailable("down".into())).await;
        let sink = ErrorRecordSink::new(Arc::new(store.clone()), Arc::new(TestClock::new()));

        let err = sink.record(&dead_message(), &info()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::PersistenceFailed { .. }));
        assert!(store.records().await.is_empty());
    }
}

//! Storage abstraction for delivered logs and failure records.
//!
//! The handler writes through [`LogStore`]; the error record sink writes
//! through [`ErrorLogStore`]. Production uses the HTTP document store client,
//! tests and store-less local runs use the in-memory doubles in [`memory`].

use std::{future::Future, pin::Pin};

use docore_core::{
    error::Result,
    models::{ErrorLog, ErrorLogId, LogEvent, LogId},
};

/// Log index operations used by the delivery handler.
pub trait LogStore: Send + Sync + std::fmt::Debug + 'static {
    /// Persists one event under a freshly generated id.
    fn write<'a>(
        &'a self,
        event: &'a LogEvent,
    ) -> Pin<Box<dyn Future<Output = Result<LogId>> + Send + 'a>>;

    /// Checks that the backend is reachable.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Error index operations used by the error record sink.
pub trait ErrorLogStore: Send + Sync + std::fmt::Debug + 'static {
    /// Persists one failure record.
    fn save(&self, record: ErrorLog) -> Pin<Box<dyn Future<Output = Result<ErrorLogId>> + Send + '_>>;
}

pub mod memory {
    //! In-memory stores with failure injection.
    //!
    //! Writes can be made to fail a fixed number of times or until
    //! recovered, which is how tests simulate an unavailable backend.

    use std::{
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use docore_core::error::{CoreError, Result};
    use tokio::sync::RwLock;

    use super::{ErrorLog, ErrorLogId, ErrorLogStore, LogEvent, LogId, LogStore};

    #[derive(Debug, Default)]
    struct FailurePlan {
        remaining: usize,
        always: bool,
        error: Option<CoreError>,
    }

    impl FailurePlan {
        fn next_error(&mut self) -> Option<CoreError> {
            if self.always {
                return self.error.clone();
            }
            if self.remaining > 0 {
                self.remaining -= 1;
                return self.error.clone();
            }
            None
        }
    }

    /// In-memory log index.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryLogStore {
        documents: Arc<RwLock<Vec<(LogId, LogEvent)>>>,
        plan: Arc<RwLock<FailurePlan>>,
        attempts: Arc<AtomicUsize>,
    }

    impl InMemoryLogStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Fails the next `count` writes with `error`.
        pub async fn fail_next(&self, count: usize, error: CoreError) {
            let mut plan = self.plan.write().await;
            plan.remaining = count;
            plan.always = false;
            plan.error = Some(error);
        }

        /// Fails every write with `error` until [`recover`](Self::recover).
        pub async fn fail_always(&self, error: CoreError) {
            let mut plan = self.plan.write().await;
            plan.always = true;
            plan.error = Some(error);
        }

        /// Clears any injected failures.
        pub async fn recover(&self) {
            *self.plan.write().await = FailurePlan::default();
        }

        /// Number of write calls that reached the store, failed or not.
        pub fn write_attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Stored documents in write order.
        pub async fn documents(&self) -> Vec<(LogId, LogEvent)> {
            self.documents.read().await.clone()
        }
    }

    impl LogStore for InMemoryLogStore {
        fn write<'a>(
            &'a self,
            event: &'a LogEvent,
        ) -> Pin<Box<dyn Future<Output = Result<LogId>> + Send + 'a>> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);

                let injected = self.plan.write().await.next_error();
                if let Some(error) = injected {
                    return Err(error);
                }

                let id = LogId::new();
                self.documents.write().await.push((id, event.clone()));
                Ok(id)
            })
        }

        fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let plan = self.plan.read().await;
                match (&plan.error, plan.always) {
                    (Some(error), true) => Err(error.clone()),
                    _ => Ok(()),
                }
            })
        }
    }

    /// In-memory error index.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryErrorLogStore {
        records: Arc<RwLock<Vec<ErrorLog>>>,
        plan: Arc<RwLock<FailurePlan>>,
    }

    impl InMemoryErrorLogStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Fails the next `count` saves with `error`.
        pub async fn fail_next(&self, count: usize, error: CoreError) {
            let mut plan = self.plan.write().await;
            plan.remaining = count;
            plan.always = false;
            plan.error = Some(error);
        }

        /// Stored failure records in save order.
        pub async fn records(&self) -> Vec<ErrorLog> {
            self.records.read().await.clone()
        }
    }

    impl ErrorLogStore for InMemoryErrorLogStore {
        fn save(
            &self,
            record: ErrorLog,
        ) -> Pin<Box<dyn Future<Output = Result<ErrorLogId>> + Send + '_>> {
            Box::pin(async move {
                let injected = self.plan.write().await.next_error();
                if let Some(error) = injected {
                    return Err(error);
                }

                let id = record.id;
                self.records.write().await.push(record);
                Ok(id)
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn injected_failures_run_out() {
            let store = InMemoryLogStore::new();
            store.fail_next(2, CoreError::Unavailable("503".into())).await;
            let event = LogEvent::new("auth", "ERROR", "boom");

            assert!(store.write(&event).await.is_err());
            assert!(store.write(&event).await.is_err());
            assert!(store.write(&event).await.is_ok());

            assert_eq!(store.write_attempts(), 3);
            assert_eq!(store.documents().await.len(), 1);
        }

        #[tokio::test]
        async fn fail_always_until_recovered() {
            let store = InMemoryLogStore::new();
            store.fail_always(CoreError::Timeout { timeout_ms: 100 }).await;
            let event = LogEvent::new("auth", "INFO", "ok");

            for _ in 0..4 {
                assert!(store.write(&event).await.is_err());
            }
            assert!(store.health_check().await.is_err());

            store.recover().await;
            assert!(store.write(&event).await.is_ok());
            assert!(store.health_check().await.is_ok());
        }
    }
}

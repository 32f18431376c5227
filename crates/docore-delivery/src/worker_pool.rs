//! Supervised delivery worker tasks.
//!
//! Provides lifecycle management and graceful shutdown for the workers the
//! engine builds.

use std::{sync::Arc, time::Duration};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    worker::{DeliveryWorker, EngineStats},
};

/// Spawns delivery workers and brings them down together.
pub struct WorkerPool {
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new(stats: Arc<RwLock<EngineStats>>, cancellation_token: CancellationToken) -> Self {
        Self { stats, cancellation_token, worker_handles: Vec::new() }
    }

    /// Spawns one task per worker.
    ///
    /// Workers run until the cancellation token fires. Returns immediately
    /// after spawning.
    pub async fn spawn_workers(&mut self, workers: Vec<DeliveryWorker>) {
        info!(worker_count = workers.len(), "spawning delivery workers");

        self.stats.write().await.active_workers += workers.len();

        for worker in workers {
            let worker_id = worker.id();
            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }
    }

    /// Cancels every worker and waits for in-flight attempts to finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers are still running
    /// when `timeout` expires; those workers are aborted.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let shutdown_future = async {
            let mut panicked = 0_usize;

            for (worker_id, handle) in self.worker_handles.iter_mut().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        let panic = DeliveryError::WorkerPanic { worker_id, error: join_error.to_string() };
                        error!(error = %panic, "worker task panicked during shutdown");
                        panicked += 1;
                    },
                }
            }

            self.stats.write().await.active_workers = 0;
            panicked
        };

        let joined = tokio::time::timeout(timeout, shutdown_future).await;
        match joined {
            Ok(panicked) => {
                if panicked > 0 {
                    warn!(panicked, "some workers panicked before shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_timeout) => {
                let stuck: Vec<_> = self.worker_handles.iter().filter(|h| !h.is_finished()).collect();
                error!(
                    timeout_seconds = timeout.as_secs(),
                    stuck_workers = stuck.len(),
                    "worker shutdown timed out, aborting remaining workers"
                );
                for handle in stuck {
                    handle.abort();
                }
                self.stats.write().await.active_workers = 0;
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "WorkerPool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}

//! Delivery engine wiring the pipeline, workers and channel together.

use std::sync::Arc;

use docore_core::{Clock, EventSubscriber, InMemoryBroker, NoOpSubscriber, PartitionConsumer};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    classify::{DefaultClassifier, FailureClassifier},
    dead_letter::DeadLetterRouter,
    error::{DeliveryError, Result},
    handler::MessageHandler,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats, Pipeline},
    worker_pool::WorkerPool,
};

/// Consumes the source topic with a pool of partition-owning workers.
pub struct DeliveryEngine {
    broker: Arc<InMemoryBroker>,
    config: DeliveryConfig,
    handler: Arc<dyn MessageHandler>,
    classifier: Arc<dyn FailureClassifier>,
    event_subscriber: Arc<dyn EventSubscriber>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates an engine with the default classifier and no event
    /// subscribers.
    pub fn new(
        broker: Arc<InMemoryBroker>,
        config: DeliveryConfig,
        handler: Arc<dyn MessageHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            config,
            handler,
            classifier: Arc::new(DefaultClassifier::new()),
            event_subscriber: Arc::new(NoOpSubscriber::new()),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        }
    }

    /// Replaces the failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replaces the pipeline event subscriber.
    #[must_use]
    pub fn with_event_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.event_subscriber = subscriber;
        self
    }

    /// Dead-letter topic derived from the source topic.
    pub fn dead_letter_topic(&self) -> String {
        format!("{}{}", self.config.source_topic, self.config.dead_letter_suffix)
    }

    /// Subscribes to the source topic and spawns the workers.
    ///
    /// Partition `p` goes to worker `p % n`, where `n` is the configured
    /// worker count capped at the number of partitions. Returns immediately
    /// after spawning; use [`shutdown`](Self::shutdown) to stop.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if already started or if
    /// the worker count is zero, and `DeliveryError::Channel` if the source
    /// topic cannot be subscribed.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }
        if self.config.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }

        let consumers = self.broker.subscribe(&self.config.source_topic).await?;
        let worker_count = self.config.worker_count.min(consumers.len()).max(1);

        info!(
            topic = %self.config.source_topic,
            partitions = consumers.len(),
            worker_count,
            max_attempts = self.config.retry_policy.max_attempts,
            "starting log delivery engine"
        );

        let pipeline = Arc::new(Pipeline::new(
            self.handler.clone(),
            self.classifier.clone(),
            DeadLetterRouter::new(self.broker.clone(), self.config.dead_letter_suffix.clone()),
            self.config.retry_policy.clone(),
            self.clock.clone(),
            self.event_subscriber.clone(),
            self.stats.clone(),
        ));

        let workers = assign_partitions(consumers, worker_count)
            .into_iter()
            .enumerate()
            .filter(|(_, owned)| !owned.is_empty())
            .map(|(id, owned)| {
                DeliveryWorker::new(id, owned, pipeline.clone(), self.cancellation_token.clone())
            })
            .collect();

        let mut pool = WorkerPool::new(self.stats.clone(), self.cancellation_token.clone());
        pool.spawn_workers(workers).await;
        self.worker_pool = Some(pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Stops the workers, letting in-flight attempts finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers outlive the
    /// configured shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(pool) = self.worker_pool.take() {
            pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Shared statistics, still readable after [`shutdown`](Self::shutdown)
    /// consumes the engine.
    pub fn stats_handle(&self) -> Arc<RwLock<EngineStats>> {
        self.stats.clone()
    }

    /// Whether any worker is still running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }
}

/// Distributes consumers round-robin: partition `p` to slot `p % workers`.
fn assign_partitions(consumers: Vec<PartitionConsumer>, workers: usize) -> Vec<Vec<PartitionConsumer>> {
    let mut slots: Vec<Vec<PartitionConsumer>> = (0..workers).map(|_| Vec::new()).collect();
    for consumer in consumers {
        let slot = consumer.partition() as usize % workers;
        slots[slot].push(consumer);
    }
    slots
}

//! docore log pipeline service.
//!
//! Runs the HTTP ingress, the delivery engine and the dead-letter listener
//! in one process around an in-memory channel, and coordinates graceful
//! startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use docore_api::{shutdown_signal, start_server, AppState, Config};
use docore_core::{Clock, InMemoryBroker, RealClock};
use docore_delivery::{
    circuit::CircuitBreaker,
    client::DocumentStoreClient,
    handler::StoreWriteHandler,
    sink::{DeadLetterListener, ErrorRecordSink},
    storage::{
        memory::{InMemoryErrorLogStore, InMemoryLogStore},
        ErrorLogStore, LogStore,
    },
    DeliveryEngine,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        topic = %config.topic,
        partitions = config.topic_partitions,
        workers = config.worker_pool_size,
        max_attempts = config.max_retry_attempts,
        document_store = config.document_store_url.as_deref().unwrap_or("<in-memory>"),
        api_key = %config.api_key_masked(),
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let broker = Arc::new(InMemoryBroker::new(config.to_broker_config()));
    let dead_letter_topic = config.dead_letter_topic();
    broker.create_topic(&config.topic, config.topic_partitions).await?;
    broker.create_topic(&dead_letter_topic, config.topic_partitions).await?;

    let (log_store, error_store) = build_stores(&config)?;
    let breaker = Arc::new(CircuitBreaker::new("log-store", config.to_circuit_config(), clock.clone()));
    let handler = Arc::new(StoreWriteHandler::new(log_store.clone(), breaker.clone()));

    let mut engine =
        DeliveryEngine::new(broker.clone(), config.to_delivery_config()?, handler, clock.clone());
    engine.start().await.context("Failed to start delivery engine")?;

    let shutdown = CancellationToken::new();
    let sink = Arc::new(ErrorRecordSink::new(error_store, clock.clone()));
    // Stopped after the engine so late dead letters still become records.
    let listener = DeadLetterListener::start(&broker, &dead_letter_topic, sink, CancellationToken::new())
        .await
        .context("Failed to start dead-letter listener")?;

    let state = AppState::new(&config, broker.clone(), log_store, breaker, clock);
    let addr = config.parse_server_addr()?;
    let mut server = tokio::spawn({
        let token = shutdown.clone();
        async move { start_server(state, addr, async move { token.cancelled().await }).await }
    });

    info!(%addr, "docore is ready to receive logs");

    tokio::select! {
        () = shutdown_signal() => {},
        result = &mut server => {
            match result {
                Ok(Ok(())) => warn!("HTTP server exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
        },
    }

    shutdown.cancel();
    let grace = Duration::from_secs(config.shutdown_timeout_seconds);

    if !server.is_finished() && tokio::time::timeout(grace, &mut server).await.is_err() {
        warn!("HTTP server did not drain in time");
        server.abort();
    }

    let stats = engine.stats_handle();
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not stop cleanly");
    }
    let stats = stats.read().await.clone();
    if let Err(e) = listener.shutdown(grace).await {
        error!(error = %e, "dead-letter listener did not stop cleanly");
    }

    info!(
        received = stats.messages_received,
        succeeded = stats.messages_succeeded,
        dead_lettered = stats.messages_dead_lettered,
        skipped = stats.messages_skipped,
        "docore shutdown complete"
    );
    Ok(())
}

/// Initializes tracing with the configured filter.
fn init_tracing(filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(filter).context("Invalid RUST_LOG filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Document store client when a URL is configured, in-memory stores
/// otherwise.
fn build_stores(config: &Config) -> Result<(Arc<dyn LogStore>, Arc<dyn ErrorLogStore>)> {
    if let Some(store_config) = config.to_store_config() {
        info!(
            base_url = %store_config.base_url,
            log_index = %store_config.log_index,
            error_index = %store_config.error_index,
            "using document store"
        );
        let client = Arc::new(DocumentStoreClient::new(store_config)?);
        let log_store: Arc<dyn LogStore> = client.clone();
        let error_store: Arc<dyn ErrorLogStore> = client;
        return Ok((log_store, error_store));
    }

    warn!("DOCUMENT_STORE_URL not set, delivered logs are kept in memory");
    let log_store: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
    let error_store: Arc<dyn ErrorLogStore> = Arc::new(InMemoryErrorLogStore::new());
    Ok((log_store, error_store))
}

//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. API key authentication (ingest routes only)
//! 5. Rate limiting (ingest routes only)
//! 6. Handler execution
//!
//! Health routes skip authentication and rate limiting.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use docore_core::{Clock, Publisher};
use docore_delivery::{circuit::CircuitBreaker, storage::LogStore};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    handlers,
    middleware::{
        auth::auth_middleware,
        rate_limit::{rate_limit_middleware, RateLimiter},
    },
};

/// Shared state for every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    /// Channel the ingest handler publishes to.
    pub publisher: Arc<dyn Publisher>,
    /// Topic log events are published to.
    pub topic: String,
    /// Log store checked by the health endpoint.
    pub store: Arc<dyn LogStore>,
    /// Breaker guarding store writes, reported by the health endpoint.
    pub breaker: Arc<CircuitBreaker>,
    /// Time source for timestamps and the rate limiter.
    pub clock: Arc<dyn Clock>,
    /// SHA-256 digest of the configured API key.
    pub api_key_digest: Option<String>,
    /// Ingest rate limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl AppState {
    /// Builds the state from configuration and the running components.
    pub fn new(
        config: &Config,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn LogStore>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            publisher,
            topic: config.topic.clone(),
            store,
            breaker,
            api_key_digest: config.api_key.as_deref().map(|key| sha256::digest(key.as_bytes())),
            rate_limiter: Arc::new(RateLimiter::new(config.to_rate_limit_config(), clock.clone())),
            clock,
            request_timeout: Duration::from_secs(config.request_timeout),
        }
    }
}

/// Creates the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use docore_api::{create_router, AppState};
///
/// fn build(state: AppState) {
///     let app = create_router(state);
///     // Serve the app...
/// }
/// ```
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check));

    let api_routes = Router::new()
        .route("/api/logs", post(handlers::ingest_log))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(health_routes)
        .merge(api_routes)
        .layer(TimeoutLayer::new(state.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Middleware to inject request ID into all responses.
///
/// Adds X-Request-Id header for tracing requests across services.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves the API on `addr` until `shutdown` completes.
///
/// In-flight requests finish before this returns.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or serving fails.
pub async fn start_server<F>(state: AppState, addr: SocketAddr, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    warn!("Draining in-flight requests and delivery workers");
}

//! Health check handlers for service monitoring.
//!
//! `/health` and `/ready` check document store reachability and report the
//! store circuit breaker; `/live` only proves the process answers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use docore_core::Clock;
use docore_delivery::{
    circuit::{CircuitBreaker, CircuitBreakerState, CircuitStatus},
    storage::LogStore,
};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::server::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Store reachable but writes are being shed by the breaker
    Degraded,
    /// Document store unreachable
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Document store reachability
    pub document_store: ComponentHealth,
    /// Breaker guarding store writes
    pub circuit_breaker: CircuitBreakerState,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Health service that encapsulates clock dependency for testable health
/// checks.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks the store and reads the breaker state.
    pub async fn health_check(&self, store: &dyn LogStore, breaker: &CircuitBreaker) -> HealthResponse {
        debug!("Performing health check");

        let timestamp = self.clock.now_utc();
        let start_time = self.clock.now();

        let (status, message) = match store.health_check().await {
            Ok(()) => (ComponentStatus::Up, None),
            Err(e) => {
                error!(error = %e, "document store health check failed");
                (ComponentStatus::Down, Some(format!("Document store unreachable: {e}")))
            },
        };
        let elapsed = self.clock.now().saturating_duration_since(start_time);
        let breaker_state = breaker.snapshot().await;

        let overall_status = match (status, breaker_state.status) {
            (ComponentStatus::Down, _) => HealthStatus::Unhealthy,
            (ComponentStatus::Up, CircuitStatus::Closed) => HealthStatus::Healthy,
            (ComponentStatus::Up, _) => HealthStatus::Degraded,
        };

        HealthResponse {
            status: overall_status,
            timestamp,
            checks: HealthChecks {
                document_store: ComponentHealth {
                    status,
                    message,
                    response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                },
                circuit_breaker: breaker_state,
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Health check endpoint handler.
///
/// Responds 503 only when the document store is unreachable; an open
/// breaker is reported as degraded with 200.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let health_service = HealthService::new(app_state.clock.clone());
    let response = health_service.health_check(app_state.store.as_ref(), &app_state.breaker).await;

    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(
        status = ?response.status,
        store_status = ?response.checks.document_store.status,
        breaker = %response.checks.circuit_breaker.status,
        "Health check completed"
    );

    (status_code, Json(response)).into_response()
}

/// Readiness check endpoint for Kubernetes probes.
#[instrument(name = "readiness_check", skip(app_state))]
pub async fn readiness_check(State(app_state): State<AppState>) -> Response {
    health_check(State(app_state)).await
}

/// Liveness check endpoint for Kubernetes probes.
///
/// Does not touch external dependencies.
#[instrument(name = "liveness_check", skip(app_state))]
pub async fn liveness_check(State(app_state): State<AppState>) -> Response {
    debug!("Performing liveness check");

    let response = serde_json::json!({
        "status": "alive",
        "timestamp": app_state.clock.now_utc(),
        "service": "docore"
    });

    (StatusCode::OK, Json(response)).into_response()
}

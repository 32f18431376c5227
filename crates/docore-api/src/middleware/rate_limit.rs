//! Fixed-window rate limiting for the ingest route.
//!
//! At most `limit_per_period` requests are admitted per window; the window
//! restarts once `period` has elapsed on the clock. Excess requests get 429
//! without reaching the handler.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use docore_core::Clock;
use tokio::sync::Mutex;
use tracing::warn;

use crate::server::AppState;

/// Limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per period.
    pub limit_per_period: u32,
    /// Window length.
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { limit_per_period: 100, period: Duration::from_secs(1) }
    }
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    admitted: u32,
}

/// Shared fixed-window limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    window: Mutex<Window>,
}

impl RateLimiter {
    /// Creates a limiter whose first window starts now.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self { config, clock, window: Mutex::new(Window { started_at, admitted: 0 }) }
    }

    /// Takes a permit from the current window, returning `false` when the
    /// window is exhausted.
    pub async fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut window = self.window.lock().await;

        if now.saturating_duration_since(window.started_at) >= self.config.period {
            window.started_at = now;
            window.admitted = 0;
        }

        if window.admitted < self.config.limit_per_period {
            window.admitted += 1;
            true
        } else {
            false
        }
    }
}

/// Rejects requests over the limit with 429.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if state.rate_limiter.try_acquire().await {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "rate limit exceeded");
        (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response()
    }
}

//! Circuit breaker protecting the document store.
//!
//! One breaker guards one call-site and is shared by every worker. Admission,
//! outcome recording and all state transitions happen under a single mutex,
//! so workers always observe a consistent state.
//!
//! # Circuit Breaker State Machine
//!
//! ```text
//!                          ┌─────────────────────────┐
//!                          │        CLOSED           │
//!                          │   (Normal Operation)    │
//!                          │                         │
//!                          │ ● All calls allowed     │
//!                          │ ● Trailing time window  │
//!                          └─────────────────────────┘
//!                           │                        ▲
//!                           │                        │
//!       threshold failures  │                        │ all probes succeed
//!       OR rate over window │                        │
//!                           ▼                        │
//!    ┌─────────────────────────┐                  ┌───────────────────────┐
//!    │         OPEN            │                  │       HALF-OPEN       │
//!    │      (Fail Fast)        │                  │   (Testing Recovery)  │
//!    │                         │    cool-down     │                       │
//!    │ ● Calls rejected        │ ───────────────▶ │ ● Probe calls only    │
//!    │ ● Store never touched   │                  │                       │
//!    └─────────────────────────┘                  └───────────────────────┘
//!                 ▲                                           │
//!                 │                               any probe   │
//!                 └─────────────────────────────────failure───┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docore_core::RealClock;
//! use docore_delivery::circuit::{CircuitBreaker, CircuitConfig};
//!
//! # async fn example() -> docore_delivery::Result<()> {
//! let breaker = CircuitBreaker::new("log-store", CircuitConfig::default(), Arc::new(RealClock::new()));
//!
//! breaker
//!     .execute(
//!         || async { Ok(()) },
//!         |err| tracing::warn!(error = %err, "store write failed"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use docore_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{DeliveryError, Result};

/// Breaker thresholds and timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Length of the trailing window.
    pub window: Duration,
    /// Calls within the window before the failure rate is considered.
    pub minimum_calls: u32,
    /// Failure rate (0.0 to 1.0) that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Cool-down before an open circuit admits a probe.
    pub open_timeout: Duration,
    /// Probes admitted while half-open.
    pub half_open_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(10),
            minimum_calls: 10,
            failure_rate_threshold: 0.5,
            open_timeout: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

/// Status of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls pass through.
    Closed,
    /// Calls are rejected.
    Open,
    /// Probe calls decide whether to close or reopen.
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    /// Current status.
    pub status: CircuitStatus,
    /// Failures recorded in the current window.
    pub failure_count: u32,
    /// When the status last changed.
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Probe,
}

#[derive(Debug)]
struct BreakerInner {
    status: CircuitStatus,
    // (recorded at, failed)
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probes_admitted: u32,
    probes_succeeded: u32,
    last_probe_at: Option<Instant>,
    last_transition: DateTime<Utc>,
}

impl BreakerInner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.window.front() {
            if now.saturating_duration_since(at) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> u32 {
        let count = self.window.iter().filter(|(_, failed)| *failed).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn calls(&self) -> u32 {
        u32::try_from(self.window.len()).unwrap_or(u32::MAX)
    }
}

/// Shared circuit breaker around a fallible async call.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        let last_transition = clock.now_utc();
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                status: CircuitStatus::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probes_admitted: 0,
                probes_succeeded: 0,
                last_probe_at: None,
                last_transition,
            }),
        }
    }

    /// Name used in logs and `CircuitOpen` errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Runs `op` under the breaker.
    ///
    /// When the breaker rejects the call, `op` is never invoked and the
    /// result is [`DeliveryError::CircuitOpen`]. `fallback` sees every
    /// rejection and every failure of `op`; the error is still returned so
    /// the caller can classify it.
    ///
    /// Only dependency failures (unavailable, timeout, internal) count
    /// against the breaker. A document the store rejected proves the store
    /// is up and is recorded as a success.
    ///
    /// # Errors
    ///
    /// Returns the rejection or the error produced by `op`.
    pub async fn execute<T, F, Fut, FB>(&self, op: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce(&DeliveryError),
    {
        let Some(permit) = self.acquire().await else {
            let err = DeliveryError::circuit_open(&self.name);
            fallback(&err);
            return Err(err);
        };

        let result = op().await;
        let failed = result.as_ref().err().is_some_and(DeliveryError::is_dependency_failure);
        self.record(permit, failed).await;

        if let Err(err) = &result {
            fallback(err);
        }
        result
    }

    /// Current status and window failure count.
    pub async fn snapshot(&self) -> CircuitBreakerState {
        let mut inner = self.inner.lock().await;
        inner.prune(self.clock.now(), self.config.window);
        CircuitBreakerState {
            status: inner.status,
            failure_count: inner.failures(),
            last_transition_time: inner.last_transition,
        }
    }

    /// Current status.
    pub async fn status(&self) -> CircuitStatus {
        self.inner.lock().await.status
    }

    /// Forces the breaker into `status` (admin and test use).
    #[allow(clippy::significant_drop_tightening)] // Atomic state change required
    pub async fn force_state(&self, status: CircuitStatus) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, status, now);
    }

    #[allow(clippy::significant_drop_tightening)] // Admission and transition are one step
    async fn acquire(&self) -> Option<Permit> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        match inner.status {
            CircuitStatus::Closed => Some(Permit::Normal),
            CircuitStatus::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= self.config.open_timeout);
                if !cooled {
                    return None;
                }
                self.transition(&mut inner, CircuitStatus::HalfOpen, now);
                inner.probes_admitted = 1;
                inner.last_probe_at = Some(now);
                Some(Permit::Probe)
            },
            CircuitStatus::HalfOpen => {
                if inner.probes_admitted < self.config.half_open_probes.max(1) {
                    inner.probes_admitted += 1;
                    inner.last_probe_at = Some(now);
                    return Some(Permit::Probe);
                }

                // A probe that never reported back (its task died) must not
                // wedge the breaker half-open forever.
                let stale = inner
                    .last_probe_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= self.config.open_timeout);
                if stale {
                    tracing::debug!(breaker = %self.name, "re-admitting probe after stale probe");
                    inner.probes_admitted = 1;
                    inner.probes_succeeded = 0;
                    inner.last_probe_at = Some(now);
                    return Some(Permit::Probe);
                }
                None
            },
        }
    }

    #[allow(clippy::significant_drop_tightening)] // Recording and transition are one step
    async fn record(&self, permit: Permit, failed: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        match (permit, inner.status) {
            (Permit::Normal, CircuitStatus::Closed) => {
                inner.window.push_back((now, failed));
                inner.prune(now, self.config.window);
                if failed && self.should_open(&inner) {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures(),
                        calls = inner.calls(),
                        "circuit breaker opening"
                    );
                    self.transition(&mut inner, CircuitStatus::Open, now);
                }
            },
            (Permit::Probe, CircuitStatus::HalfOpen) => {
                if failed {
                    tracing::warn!(breaker = %self.name, "probe failed, circuit breaker reopening");
                    self.transition(&mut inner, CircuitStatus::Open, now);
                } else {
                    inner.probes_succeeded += 1;
                    if inner.probes_succeeded >= self.config.half_open_probes.max(1) {
                        tracing::info!(breaker = %self.name, "circuit breaker closing, store recovered");
                        self.transition(&mut inner, CircuitStatus::Closed, now);
                    }
                }
            },
            // Outcome of a call admitted under a state that no longer holds.
            _ => {},
        }
    }

    fn should_open(&self, inner: &BreakerInner) -> bool {
        let failures = inner.failures();
        if failures >= self.config.failure_threshold {
            return true;
        }

        let calls = inner.calls();
        calls >= self.config.minimum_calls
            && calls > 0
            && f64::from(failures) / f64::from(calls) >= self.config.failure_rate_threshold
    }

    fn transition(&self, inner: &mut BreakerInner, status: CircuitStatus, now: Instant) {
        if inner.status != status {
            tracing::debug!(breaker = %self.name, from = %inner.status, to = %status, "circuit transition");
        }

        inner.status = status;
        inner.last_transition = self.clock.now_utc();
        inner.probes_admitted = 0;
        inner.probes_succeeded = 0;
        inner.last_probe_at = None;

        match status {
            CircuitStatus::Open => inner.opened_at = Some(now),
            CircuitStatus::Closed => {
                inner.opened_at = None;
                inner.window.clear();
            },
            CircuitStatus::HalfOpen => {},
        }
    }
}

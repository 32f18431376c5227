//! HTTP request handlers for the docore API.
//!
//! - `ingest` - log event ingestion
//! - `health` - health, readiness and liveness probes
//!
//! Errors are returned as `{"error": {"code", "message"}}` with codes from
//! `DocoreError::code`.

pub mod health;
pub mod ingest;

pub use health::{health_check, liveness_check, readiness_check};
pub use ingest::ingest_log;

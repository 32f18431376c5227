//! Error taxonomy shared across the ingestion and delivery crates.
//!
//! [`CoreError`] covers storage and serialization failures raised below the
//! pipeline. [`DocoreError`] is the client-facing taxonomy with stable codes
//! used by the HTTP surface.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by storage backends and payload codecs.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Backend could not be reached or answered with a server error.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Backend did not answer in time.
    #[error("store timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that was exceeded in milliseconds
        timeout_ms: u64,
    },

    /// Backend refused the document as invalid.
    #[error("document rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status returned by the backend
        status: u16,
        /// Backend error body
        message: String,
    },

    /// Payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Client-facing errors with codes.
#[derive(Debug, Error)]
pub enum DocoreError {
    // Request errors
    /// Request body is not a log event (E1002).
    #[error("[E1002] Malformed log event: {reason}")]
    MalformedEvent {
        /// Why the body could not be parsed
        reason: String,
    },

    /// Required field missing or blank (E1003).
    #[error("[E1003] Missing required field: {field}")]
    MissingField {
        /// Wire name of the missing field
        field: &'static str,
    },

    // System errors
    /// Message channel rejected the publish (E3001).
    #[error("[E3001] Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Generic error for wrapping other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DocoreError {
    /// Returns the error code reported to HTTP clients.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MalformedEvent { .. } => "E1002",
            Self::MissingField { .. } => "E1003",
            Self::ChannelUnavailable(_) => "E3001",
            Self::Other(_) => "E9999",
        }
    }
}

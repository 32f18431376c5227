//! Error types for log delivery.
//!
//! Every failure a handler, the breaker, the dead-letter router or the sink
//! can produce is a [`DeliveryError`]. Each variant maps to an
//! [`ErrorCategory`] whose display name is what ends up as the
//! `failureReason` of a persisted error record.

use std::{fmt, time::Duration};

use docore_core::{ChannelError, CoreError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failures raised while delivering a message.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Payload could not be decoded as a log event.
    #[error("malformed payload: {message}")]
    MalformedPayload {
        /// Decoder error
        message: String,
    },

    /// Event or document was rejected as invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Rejection reason
        message: String,
    },

    /// Required field is absent or blank.
    #[error("missing required field: {field}")]
    MissingField {
        /// Wire name of the field
        field: String,
    },

    /// Storage backend failed in a way that may clear up.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Backend error
        message: String,
    },

    /// Storage call exceeded its timeout.
    #[error("store timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Circuit breaker refused the call.
    #[error("circuit breaker {breaker} is open")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        breaker: String,
    },

    /// Error record could not be persisted.
    #[error("failed to persist error record: {message}")]
    PersistenceFailed {
        /// Backend error
        message: String,
    },

    /// Message channel failed.
    #[error("channel error: {message}")]
    Channel {
        /// Channel error
        message: String,
    },

    /// Component was configured incorrectly.
    #[error("configuration error: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Worker shutdown requested.
    #[error("worker shutdown requested")]
    ShutdownRequested,

    /// Workers did not stop in time.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// Worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker identifier
        worker_id: usize,
        /// Panic description
        error: String,
    },

    /// Unexpected internal error, including handler panics.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a malformed payload error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload { message: message.into() }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField { field: field.into() }
    }

    /// Creates a store unavailable error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(breaker: impl Into<String>) -> Self {
        Self::CircuitOpen { breaker: breaker.into() }
    }

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceFailed { message: message.into() }
    }

    /// Creates a channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether another attempt could succeed.
    ///
    /// Malformed payloads, invalid arguments and missing fields never
    /// succeed on retry. Everything else, including circuit rejections, is
    /// worth another attempt while budget remains.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::MalformedPayload { .. } | Self::InvalidArgument { .. } | Self::MissingField { .. }
        )
    }

    /// Whether a breaker should count this as a dependency failure.
    ///
    /// A rejected document means the store answered, so only errors that
    /// say nothing about the payload count.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Timeout { .. } | Self::InternalError { .. })
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unavailable(message) => Self::StoreUnavailable { message },
            CoreError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            CoreError::Rejected { status, message } => {
                Self::InvalidArgument { message: format!("store rejected document ({status}): {message}") }
            },
            CoreError::Serialization(message) => Self::MalformedPayload { message },
        }
    }
}

impl From<ChannelError> for DeliveryError {
    fn from(err: ChannelError) -> Self {
        Self::Channel { message: err.to_string() }
    }
}

/// Failure category; its display name is the persisted `failureReason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Payload could not be decoded.
    MalformedMessage,
    /// Input rejected as invalid.
    InvalidArgument,
    /// Required field absent.
    MissingField,
    /// Store unavailable or slow.
    TransientDependencyFailure,
    /// Breaker refused the call.
    CircuitOpenRejection,
    /// Error record could not be saved.
    PersistenceFailure,
    /// Channel publish or consume failed.
    ChannelFailure,
    /// Misconfiguration.
    Configuration,
    /// Shutdown in progress.
    Shutdown,
    /// Internal errors and handler panics.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::MalformedPayload { .. } => Self::MalformedMessage,
            DeliveryError::InvalidArgument { .. } => Self::InvalidArgument,
            DeliveryError::MissingField { .. } => Self::MissingField,
            DeliveryError::StoreUnavailable { .. } | DeliveryError::Timeout { .. } => {
                Self::TransientDependencyFailure
            },
            DeliveryError::CircuitOpen { .. } => Self::CircuitOpenRejection,
            DeliveryError::PersistenceFailed { .. } => Self::PersistenceFailure,
            DeliveryError::Channel { .. } => Self::ChannelFailure,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownRequested | DeliveryError::ShutdownTimeout { .. } => {
                Self::Shutdown
            },
            DeliveryError::WorkerPanic { .. } | DeliveryError::InternalError { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedMessage => "MalformedMessage",
            Self::InvalidArgument => "InvalidArgument",
            Self::MissingField => "MissingField",
            Self::TransientDependencyFailure => "TransientDependencyFailure",
            Self::CircuitOpenRejection => "CircuitOpenRejection",
            Self::PersistenceFailure => "PersistenceFailure",
            Self::ChannelFailure => "ChannelFailure",
            Self::Configuration => "Configuration",
            Self::Shutdown => "Shutdown",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

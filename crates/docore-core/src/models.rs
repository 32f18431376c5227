//! Log event and failure record models with strongly-typed identifiers.
//!
//! [`LogEvent`] is the wire format carried on the channel and written to the
//! log index. [`ErrorLog`] is the persisted record for a dead-lettered
//! message. Field names are camelCase on the wire to match producers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::{error::CoreError, time::Clock};

/// Identifier of a log document in the log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId(pub Uuid);

impl LogId {
    /// Creates a new random log ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for LogId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of a failure record in the error index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorLogId(pub Uuid);

impl ErrorLogId {
    /// Creates a new random error log ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ErrorLogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ErrorLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ErrorLogId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Structured log event emitted by an upstream service.
///
/// Immutable once published. The timestamp is assigned by ingress when the
/// producer leaves it out.
///
/// # Example
///
/// ```
/// use docore_core::models::LogEvent;
///
/// let event = LogEvent::new("auth", "ERROR", "token expired").with_status_code("401");
/// assert!(event.missing_field().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Name of the emitting service; also the ordering key on the channel.
    #[serde(default)]
    pub service_name: String,

    /// Severity such as `INFO` or `ERROR`.
    #[serde(default)]
    pub log_level: String,

    /// Free-form log line.
    #[serde(default)]
    pub message: String,

    /// HTTP-ish status code reported by the producer, kept as text.
    #[serde(default, deserialize_with = "string_or_number")]
    pub status_code: Option<String>,

    /// ISO-8601 timestamp.
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl LogEvent {
    /// Creates an event with the required fields and no timestamp.
    pub fn new(
        service_name: impl Into<String>,
        log_level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            log_level: log_level.into(),
            message: message.into(),
            status_code: None,
            timestamp: None,
        }
    }

    /// Sets the status code.
    #[must_use]
    pub fn with_status_code(mut self, status_code: impl Into<String>) -> Self {
        self.status_code = Some(status_code.into());
        self
    }

    /// Sets an explicit timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Fills the timestamp from `clock` when the producer omitted it.
    ///
    /// Returns `true` if a timestamp was assigned.
    pub fn stamp(&mut self, clock: &dyn Clock) -> bool {
        match &self.timestamp {
            Some(ts) if !ts.trim().is_empty() => false,
            _ => {
                self.timestamp = Some(clock.timestamp());
                true
            },
        }
    }

    /// Returns the wire name of the first required field that is blank.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.service_name.trim().is_empty() {
            Some("serviceName")
        } else if self.log_level.trim().is_empty() {
            Some("logLevel")
        } else if self.message.trim().is_empty() {
            Some("message")
        } else {
            None
        }
    }

    /// Decodes a channel payload.
    ///
    /// Empty payloads and a bare JSON `null` decode to `Ok(None)`; the
    /// pipeline treats those as no-ops.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the bytes are not a log event.
    pub fn from_payload(payload: &[u8]) -> Result<Option<Self>, CoreError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(serde_json::from_slice::<Option<Self>>(payload)?)
    }

    /// Encodes the event as a channel payload.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if encoding fails.
    pub fn to_payload(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Accepts `"500"`, `500` or `null` for the status code.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => {
            Err(serde::de::Error::custom(format!("statusCode must be a string or number, got {other}")))
        },
    }
}

/// Persisted record of a dead-lettered message.
///
/// Created only by the error record sink and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLog {
    /// Record identifier.
    pub id: ErrorLogId,

    /// Payload exactly as it was published, decoded as UTF-8 (lossy).
    pub original_payload: String,

    /// Failure category, e.g. `MalformedMessage`.
    pub failure_reason: String,

    /// Rendered error chain from the last failed attempt.
    pub stack_trace: String,

    /// Trace id propagated from ingress, if any.
    pub trace_id: Option<String>,

    /// When the record was created.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::time::TestClock;

    #[test]
    fn wire_format_uses_camel_case() {
        let event = LogEvent::new("auth", "ERROR", "boom").with_status_code("500");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["serviceName"], "auth");
        assert_eq!(json["logLevel"], "ERROR");
        assert_eq!(json["statusCode"], "500");
        assert!(json["timestamp"].is_null());
    }

    #[test]
    fn numeric_status_code_is_accepted() {
        let event = LogEvent::from_payload(
            br#"{"serviceName":"billing","logLevel":"WARN","message":"slow","statusCode":503}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(event.status_code.as_deref(), Some("503"));
    }

    #[test]
    fn empty_and_null_payloads_decode_to_none() {
        assert_eq!(LogEvent::from_payload(b"").unwrap(), None);
        assert_eq!(LogEvent::from_payload(b"  \n").unwrap(), None);
        assert_eq!(LogEvent::from_payload(b"null").unwrap(), None);
    }

    #[test]
    fn garbage_payload_is_a_serialization_error() {
        let err = LogEvent::from_payload(b"{not json").unwrap_err();
        assert!(matches!(err, CoreError::Serialization(_)));
    }

    #[test]
    fn stamp_only_fills_missing_timestamp() {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_714_557_600));

        let mut unstamped = LogEvent::new("auth", "INFO", "login");
        assert!(unstamped.stamp(&clock));
        assert_eq!(unstamped.timestamp.as_deref(), Some("2024-05-01T10:00:00.000Z"));

        let mut stamped = LogEvent::new("auth", "INFO", "login").with_timestamp("2020-01-01T00:00:00Z");
        assert!(!stamped.stamp(&clock));
        assert_eq!(stamped.timestamp.as_deref(), Some("2020-01-01T00:00:00Z"));
    }

    #[test]
    fn missing_field_reports_first_blank_field() {
        assert_eq!(LogEvent::new("", "INFO", "x").missing_field(), Some("serviceName"));
        assert_eq!(LogEvent::new("auth", " ", "x").missing_field(), Some("logLevel"));
        assert_eq!(LogEvent::new("auth", "INFO", "").missing_field(), Some("message"));
        assert_eq!(LogEvent::new("auth", "INFO", "x").missing_field(), None);
    }
}

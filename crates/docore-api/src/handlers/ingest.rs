//! Log event ingestion handler.
//!
//! Validates the event, fills in the timestamp, assigns a trace id and
//! publishes the event to the channel keyed by service name. Delivery to the
//! document store happens later; callers never see downstream failures.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use docore_core::{models::LogEvent, DocoreError, OutgoingRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::server::AppState;

/// Header carrying the caller's trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Response from successful ingestion.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// Human-readable status
    pub status: String,
    /// Trace id attached to the published message
    pub trace_id: String,
}

/// Error response with code and message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error code from our taxonomy (E1002, E1003, E3001)
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Accepts one log event and hands it to the channel.
///
/// Returns 200 once the channel accepted the record.
///
/// # Errors
///
/// Returns appropriate HTTP status codes:
/// - 400: Body is not a log event, or a required field is blank
/// - 503: The channel rejected the publish
#[instrument(
    name = "ingest_log",
    skip(state, headers, body),
    fields(
        trace_id = tracing::field::Empty,
        service_name = tracing::field::Empty,
        content_length = body.len(),
    )
)]
pub async fn ingest_log(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let span = tracing::Span::current();

    let mut event: LogEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "rejecting malformed log event");
            return create_error_response(
                StatusCode::BAD_REQUEST,
                &DocoreError::MalformedEvent { reason: e.to_string() },
            );
        },
    };

    if let Some(field) = event.missing_field() {
        warn!(field, "rejecting log event with missing field");
        return create_error_response(StatusCode::BAD_REQUEST, &DocoreError::MissingField { field });
    }

    if event.stamp(state.clock.as_ref()) {
        debug!("timestamp defaulted to current time");
    }

    let trace_id = headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);
    span.record("trace_id", trace_id.as_str());
    span.record("service_name", event.service_name.as_str());

    let payload = match event.to_payload() {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "failed to encode log event");
            return create_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &DocoreError::Other(anyhow::anyhow!("failed to encode log event: {e}")),
            );
        },
    };

    let record = OutgoingRecord::new(state.topic.as_str(), payload)
        .with_key(event.service_name.clone())
        .with_trace_id(trace_id.clone());

    match state.publisher.publish(record).await {
        Ok(receipt) => {
            info!(
                topic = %receipt.topic,
                partition = receipt.partition,
                offset = receipt.offset,
                "log event published"
            );
            (
                StatusCode::OK,
                Json(IngestResponse { status: "Log event accepted".to_string(), trace_id }),
            )
                .into_response()
        },
        Err(e) => {
            error!(error = %e, "channel rejected log event");
            create_error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &DocoreError::ChannelUnavailable(e.to_string()),
            )
        },
    }
}

/// Creates a standardized error response.
fn create_error_response(status: StatusCode, error: &DocoreError) -> Response {
    let error_response = ErrorResponse {
        error: ErrorDetail { code: error.code().to_string(), message: error.to_string() },
    };

    (status, Json(error_response)).into_response()
}

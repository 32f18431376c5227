//! API key authentication middleware.
//!
//! Compares the SHA-256 digest of the `X-API-KEY` header against the digest
//! of the configured key. When no key is configured every request is
//! rejected.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::server::AppState;

/// Header carrying the client's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Extracts the API key from the `X-API-KEY` header.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()).filter(|key| !key.is_empty())
}

/// Whether `presented` matches the configured key digest.
fn is_valid(expected_digest: Option<&str>, presented: Option<&str>) -> bool {
    match (expected_digest, presented) {
        (Some(expected), Some(key)) => sha256::digest(key.as_bytes()) == expected,
        _ => false,
    }
}

/// Authentication failures.
#[derive(Debug)]
pub enum AuthError {
    /// Header missing, wrong, or no key configured.
    InvalidApiKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidApiKey => (StatusCode::UNAUTHORIZED, "Invalid API Key").into_response(),
        }
    }
}

/// Axum middleware that authenticates requests using the API key.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let presented = extract_api_key(req.headers());

    if !is_valid(state.api_key_digest.as_deref(), presented) {
        warn!(
            path = %req.uri().path(),
            key_present = presented.is_some(),
            configured = state.api_key_digest.is_some(),
            "rejecting request with invalid API key"
        );
        return Err(AuthError::InvalidApiKey);
    }

    Ok(next.run(req).await)
}

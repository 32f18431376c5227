//! HTTP client for an Elasticsearch-compatible document store.
//!
//! Documents are indexed with `PUT {base_url}/{index}/_doc/{id}`. Response
//! statuses are mapped onto [`CoreError`] so the pipeline can tell a store
//! that is down from a document the store refused.

use std::{future::Future, pin::Pin, time::Duration};

use docore_core::{
    error::{CoreError, Result as StoreResult},
    models::{ErrorLog, ErrorLogId, LogEvent, LogId},
};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    storage::{ErrorLogStore, LogStore},
};

/// Rejection bodies longer than this are truncated in errors.
const MAX_ERROR_BODY: usize = 1024;

/// Document store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL, e.g. `http://localhost:9200`.
    pub base_url: String,
    /// Index receiving delivered log events.
    pub log_index: String,
    /// Index receiving failure records.
    pub error_index: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            log_index: "app-logs".to_string(),
            error_index: "docore-error-logs".to_string(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "DOCore-Log-Pipeline/1.0".to_string(),
        }
    }
}

/// Document store client implementing both store traits.
#[derive(Debug, Clone)]
pub struct DocumentStoreClient {
    client: reqwest::Client,
    config: StoreConfig,
}

impl DocumentStoreClient {
    /// Creates a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn document_url(&self, index: &str, id: &str) -> String {
        format!("{}/{index}/_doc/{id}", self.config.base_url.trim_end_matches('/'))
    }

    async fn put_document<T: Serialize + Sync>(&self, index: &str, id: &str, body: &T) -> StoreResult<()> {
        let url = self.document_url(index, id);
        let span = info_span!("store_put", index = %index, document_id = %id);

        async move {
            let response = self
                .client
                .put(&url)
                .json(body)
                .send()
                .await
                .map_err(|e| self.map_transport_error(&e))?;

            let status = response.status();
            if status.is_success() {
                tracing::debug!(status = status.as_u16(), "document indexed");
                return Ok(());
            }

            let body = response.text().await.unwrap_or_default();
            let message = truncate(&body);
            tracing::warn!(status = status.as_u16(), "document store returned error");

            if status.as_u16() == 429 || status.is_server_error() {
                Err(CoreError::Unavailable(format!("status {}: {message}", status.as_u16())))
            } else {
                Err(CoreError::Rejected { status: status.as_u16(), message })
            }
        }
        .instrument(span)
        .await
    }

    /// Checks reachability with `GET {base_url}`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Unavailable` or `CoreError::Timeout` when the
    /// store does not answer with a success status.
    pub async fn ping(&self) -> StoreResult<()> {
        let response = self
            .client
            .get(self.config.base_url.trim_end_matches('/'))
            .send()
            .await
            .map_err(|e| self.map_transport_error(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CoreError::Unavailable(format!("health check returned {}", response.status())))
        }
    }

    fn map_transport_error(&self, error: &reqwest::Error) -> CoreError {
        if error.is_timeout() {
            let timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
            CoreError::Timeout { timeout_ms }
        } else if error.is_connect() {
            CoreError::Unavailable(format!("connection failed: {error}"))
        } else {
            CoreError::Unavailable(error.to_string())
        }
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

impl LogStore for DocumentStoreClient {
    fn write<'a>(
        &'a self,
        event: &'a LogEvent,
    ) -> Pin<Box<dyn Future<Output = StoreResult<LogId>> + Send + 'a>> {
        Box::pin(async move {
            let id = LogId::new();
            self.put_document(&self.config.log_index, &id.to_string(), event).await?;
            Ok(id)
        })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + '_>> {
        Box::pin(self.ping())
    }
}

impl ErrorLogStore for DocumentStoreClient {
    fn save(&self, record: ErrorLog) -> Pin<Box<dyn Future<Output = StoreResult<ErrorLogId>> + Send + '_>> {
        Box::pin(async move {
            let id = record.id;
            self.put_document(&self.config.error_index, &id.to_string(), &record).await?;
            Ok(id)
        })
    }
}

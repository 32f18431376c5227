//! Configuration management for the docore log pipeline.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use docore_core::BrokerConfig;
use docore_delivery::{
    circuit::CircuitConfig,
    client::StoreConfig,
    retry::{BackoffStrategy, RetryPolicy},
    DeliveryConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::middleware::rate_limit::RateLimitConfig;

const CONFIG_FILE: &str = "docore.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`docore.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Without `DOCUMENT_STORE_URL` the service keeps delivered logs in memory,
/// which is only useful for local runs. Without `API_KEY` every request to
/// the ingest API is rejected.
///
/// # Example
///
/// ```no_run
/// use docore_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Channel
    /// Topic log events are published to.
    ///
    /// Environment variable: `TOPIC`
    #[serde(default = "default_topic", alias = "TOPIC")]
    pub topic: String,
    /// Partitions of the source and dead-letter topics.
    ///
    /// Environment variable: `TOPIC_PARTITIONS`
    #[serde(default = "default_topic_partitions", alias = "TOPIC_PARTITIONS")]
    pub topic_partitions: u32,
    /// Buffered records per partition before publishers wait.
    ///
    /// Environment variable: `CHANNEL_CAPACITY`
    #[serde(default = "default_channel_capacity", alias = "CHANNEL_CAPACITY")]
    pub channel_capacity: usize,

    // Delivery
    /// Number of concurrent delivery workers.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,
    /// Seconds to wait for workers on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,
    /// Suffix appended to the topic to name its dead-letter topic.
    ///
    /// Environment variable: `DEAD_LETTER_SUFFIX`
    #[serde(default = "default_dead_letter_suffix", alias = "DEAD_LETTER_SUFFIX")]
    pub dead_letter_suffix: String,

    // Retry
    /// Total attempts per message, including the first.
    ///
    /// Environment variable: `MAX_RETRY_ATTEMPTS`
    #[serde(default = "default_retry_attempts", alias = "MAX_RETRY_ATTEMPTS")]
    pub max_retry_attempts: u32,
    /// Delay between attempts in milliseconds.
    ///
    /// Environment variable: `RETRY_DELAY_MS`
    #[serde(default = "default_retry_delay_ms", alias = "RETRY_DELAY_MS")]
    pub retry_delay_ms: u64,
    /// Backoff strategy: `fixed`, `linear` or `exponential`.
    ///
    /// Environment variable: `RETRY_STRATEGY`
    #[serde(default = "default_retry_strategy", alias = "RETRY_STRATEGY")]
    pub retry_strategy: String,
    /// Upper bound for linear and exponential delays in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,

    // Circuit breaker
    /// Failures within the window that open the circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_THRESHOLD`
    #[serde(default = "default_failure_threshold", alias = "CIRCUIT_BREAKER_FAILURE_THRESHOLD")]
    pub circuit_breaker_failure_threshold: u32,
    /// Length of the failure window in seconds.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_WINDOW_SECONDS`
    #[serde(default = "default_circuit_window", alias = "CIRCUIT_BREAKER_WINDOW_SECONDS")]
    pub circuit_breaker_window_seconds: u64,
    /// Failure rate (0.0 to 1.0) that opens the circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_RATE_THRESHOLD`
    #[serde(default = "default_failure_rate", alias = "CIRCUIT_BREAKER_FAILURE_RATE_THRESHOLD")]
    pub circuit_breaker_failure_rate_threshold: f64,
    /// Calls within the window before the failure rate applies.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_MINIMUM_CALLS`
    #[serde(default = "default_minimum_calls", alias = "CIRCUIT_BREAKER_MINIMUM_CALLS")]
    pub circuit_breaker_minimum_calls: u32,
    /// Seconds an open circuit waits before admitting a probe.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_COOLDOWN_SECONDS`
    #[serde(default = "default_circuit_cooldown", alias = "CIRCUIT_BREAKER_COOLDOWN_SECONDS")]
    pub circuit_breaker_cooldown_seconds: u64,
    /// Probes admitted while half-open.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_PROBE_COUNT`
    #[serde(default = "default_probe_count", alias = "CIRCUIT_BREAKER_PROBE_COUNT")]
    pub circuit_breaker_probe_count: u32,

    // Document store
    /// Base URL of the document store; in-memory storage when unset.
    ///
    /// Environment variable: `DOCUMENT_STORE_URL`
    #[serde(default, alias = "DOCUMENT_STORE_URL")]
    pub document_store_url: Option<String>,
    /// Index receiving delivered log events.
    ///
    /// Environment variable: `LOG_INDEX`
    #[serde(default = "default_log_index", alias = "LOG_INDEX")]
    pub log_index: String,
    /// Index receiving failure records.
    ///
    /// Environment variable: `ERROR_INDEX`
    #[serde(default = "default_error_index", alias = "ERROR_INDEX")]
    pub error_index: String,
    /// Document store request timeout in seconds.
    ///
    /// Environment variable: `STORE_TIMEOUT_SECONDS`
    #[serde(default = "default_store_timeout", alias = "STORE_TIMEOUT_SECONDS")]
    pub store_timeout_seconds: u64,

    // Ingress protection
    /// Key expected in the `X-API-KEY` header.
    ///
    /// Environment variable: `API_KEY`
    #[serde(default, alias = "API_KEY")]
    pub api_key: Option<String>,
    /// Requests admitted per rate limit period.
    ///
    /// Environment variable: `RATE_LIMIT_PER_PERIOD`
    #[serde(default = "default_rate_limit", alias = "RATE_LIMIT_PER_PERIOD")]
    pub rate_limit_per_period: u32,
    /// Rate limit period in milliseconds.
    ///
    /// Environment variable: `RATE_LIMIT_PERIOD_MS`
    #[serde(default = "default_rate_limit_period", alias = "RATE_LIMIT_PERIOD_MS")]
    pub rate_limit_period_ms: u64,

    // Logging
    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Delivery engine configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `retry_strategy` is not a known strategy.
    pub fn to_delivery_config(&self) -> Result<DeliveryConfig> {
        Ok(DeliveryConfig {
            worker_count: self.worker_pool_size,
            source_topic: self.topic.clone(),
            retry_policy: self.to_retry_policy()?,
            dead_letter_suffix: self.dead_letter_suffix.clone(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        })
    }

    /// Retry policy for the delivery pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if `retry_strategy` is not a known strategy.
    pub fn to_retry_policy(&self) -> Result<RetryPolicy> {
        let backoff_strategy =
            BackoffStrategy::from_str(&self.retry_strategy).map_err(anyhow::Error::msg)?;
        Ok(RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_delay_ms)),
            backoff_strategy,
        })
    }

    /// Circuit breaker configuration for document store writes.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            window: Duration::from_secs(self.circuit_breaker_window_seconds),
            minimum_calls: self.circuit_breaker_minimum_calls,
            failure_rate_threshold: self.circuit_breaker_failure_rate_threshold,
            open_timeout: Duration::from_secs(self.circuit_breaker_cooldown_seconds),
            half_open_probes: self.circuit_breaker_probe_count,
        }
    }

    /// Document store client configuration, if a store URL is configured.
    pub fn to_store_config(&self) -> Option<StoreConfig> {
        self.document_store_url.as_ref().map(|url| StoreConfig {
            base_url: url.clone(),
            log_index: self.log_index.clone(),
            error_index: self.error_index.clone(),
            timeout: Duration::from_secs(self.store_timeout_seconds),
            ..StoreConfig::default()
        })
    }

    /// In-memory channel configuration.
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            default_partitions: self.topic_partitions,
            partition_capacity: self.channel_capacity,
            auto_create_topics: true,
        }
    }

    /// Ingress rate limiter configuration.
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            limit_per_period: self.rate_limit_per_period,
            period: Duration::from_millis(self.rate_limit_period_ms),
        }
    }

    /// Dead-letter topic derived from the source topic.
    pub fn dead_letter_topic(&self) -> String {
        format!("{}{}", self.topic, self.dead_letter_suffix)
    }

    /// Parse server socket address from host and port configuration.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// API key with everything but the last four characters masked.
    pub fn api_key_masked(&self) -> String {
        match &self.api_key {
            None => "<unset>".to_string(),
            Some(key) if key.chars().count() <= 4 => "***".to_string(),
            Some(key) => {
                let tail: String = key.chars().skip(key.chars().count() - 4).collect();
                format!("***{tail}")
            },
        }
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.topic.trim().is_empty() {
            anyhow::bail!("topic must not be empty");
        }

        if self.dead_letter_suffix.is_empty() {
            anyhow::bail!("dead_letter_suffix must not be empty");
        }

        if self.topic_partitions == 0 {
            anyhow::bail!("topic_partitions must be greater than 0");
        }

        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be greater than 0");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be greater than 0");
        }

        // Also paces dead-letter publish retries, which must never spin.
        if self.retry_delay_ms == 0 {
            anyhow::bail!("retry_delay_ms must be greater than 0");
        }

        if let Err(e) = BackoffStrategy::from_str(&self.retry_strategy) {
            anyhow::bail!("retry_strategy is invalid: {e}");
        }

        if self.circuit_breaker_failure_threshold == 0 {
            anyhow::bail!("circuit_breaker_failure_threshold must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.circuit_breaker_failure_rate_threshold) {
            anyhow::bail!("circuit_breaker_failure_rate_threshold must be between 0.0 and 1.0");
        }

        if self.circuit_breaker_window_seconds == 0 {
            anyhow::bail!("circuit_breaker_window_seconds must be greater than 0");
        }

        if self.circuit_breaker_probe_count == 0 {
            anyhow::bail!("circuit_breaker_probe_count must be greater than 0");
        }

        if self.rate_limit_per_period == 0 || self.rate_limit_period_ms == 0 {
            anyhow::bail!("rate limit per period and period must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            topic: default_topic(),
            topic_partitions: default_topic_partitions(),
            channel_capacity: default_channel_capacity(),
            worker_pool_size: default_worker_count(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            dead_letter_suffix: default_dead_letter_suffix(),
            max_retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_strategy: default_retry_strategy(),
            retry_max_delay_ms: default_max_delay_ms(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_window_seconds: default_circuit_window(),
            circuit_breaker_failure_rate_threshold: default_failure_rate(),
            circuit_breaker_minimum_calls: default_minimum_calls(),
            circuit_breaker_cooldown_seconds: default_circuit_cooldown(),
            circuit_breaker_probe_count: default_probe_count(),
            document_store_url: None,
            log_index: default_log_index(),
            error_index: default_error_index(),
            store_timeout_seconds: default_store_timeout(),
            api_key: None,
            rate_limit_per_period: default_rate_limit(),
            rate_limit_period_ms: default_rate_limit_period(),
            rust_log: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_topic() -> String {
    docore_delivery::DEFAULT_TOPIC.to_string()
}

fn default_topic_partitions() -> u32 {
    3
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_worker_count() -> usize {
    docore_delivery::DEFAULT_WORKER_COUNT
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_dead_letter_suffix() -> String {
    docore_delivery::dead_letter::DEFAULT_DEAD_LETTER_SUFFIX.to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_strategy() -> String {
    "fixed".to_string()
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_window() -> u64 {
    10
}

fn default_failure_rate() -> f64 {
    0.5
}

fn default_minimum_calls() -> u32 {
    10
}

fn default_circuit_cooldown() -> u64 {
    30
}

fn default_probe_count() -> u32 {
    1
}

fn default_log_index() -> String {
    "app-logs".to_string()
}

fn default_error_index() -> String {
    "docore-error-logs".to_string()
}

fn default_store_timeout() -> u64 {
    docore_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_rate_limit() -> u32 {
    100
}

fn default_rate_limit_period() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

//! Fault-tolerant log delivery.
//!
//! Consumes log events from the channel and writes them to the document
//! store, with bounded retry, failure classification, dead-letter routing
//! and a circuit breaker in front of the store.
//!
//! # Architecture
//!
//! Each worker owns a disjoint set of partitions and handles one message at
//! a time from receipt to resolution:
//!
//! 1. **Decode** - empty or null payloads are acknowledged and skipped
//! 2. **Handle** - the handler writes through the shared circuit breaker
//! 3. **Classify** - failures are retryable or terminal
//! 4. **Retry or dead-letter** - retries wait on the worker's clock;
//!    terminal or exhausted messages go to `<topic>.DLQ`
//!
//! A separate listener consumes the dead-letter topic and persists each
//! message as an error record.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docore_core::{BrokerConfig, InMemoryBroker, RealClock};
//! use docore_delivery::{
//!     circuit::{CircuitBreaker, CircuitConfig},
//!     handler::StoreWriteHandler,
//!     storage::memory::InMemoryLogStore,
//!     DeliveryConfig, DeliveryEngine,
//! };
//!
//! # async fn example() -> docore_delivery::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let broker = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
//! let breaker = Arc::new(CircuitBreaker::new("log-store", CircuitConfig::default(), clock.clone()));
//! let handler = Arc::new(StoreWriteHandler::new(Arc::new(InMemoryLogStore::new()), breaker));
//!
//! let mut engine = DeliveryEngine::new(broker, DeliveryConfig::default(), handler, clock);
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod classify;
pub mod client;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod handler;
pub mod retry;
pub mod sink;
pub mod storage;
pub mod worker;
pub mod worker_pool;

pub use engine::DeliveryEngine;
pub use error::{DeliveryError, ErrorCategory, Result};
pub use worker::{DeliveryConfig, EngineStats, Outcome};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default source topic.
pub const DEFAULT_TOPIC: &str = "docore-logs";

/// Default document store request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 5;

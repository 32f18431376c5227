//! Shared router fixtures for API tests.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use docore_api::{create_router, AppState, Config};
use docore_core::{BrokerConfig, InMemoryBroker, TestClock};
use docore_delivery::{
    circuit::{CircuitBreaker, CircuitConfig},
    storage::memory::InMemoryLogStore,
};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key-12345";
pub const TOPIC: &str = "docore-logs";

pub struct TestApp {
    pub router: Router,
    pub broker: Arc<InMemoryBroker>,
    pub store: InMemoryLogStore,
    pub breaker: Arc<CircuitBreaker>,
    pub clock: TestClock,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(Config { api_key: Some(API_KEY.to_string()), ..Config::default() }).await
    }

    pub async fn with_config(config: Config) -> Self {
        let broker = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
        broker.create_topic(TOPIC, 3).await.unwrap();
        Self::with_broker(config, broker)
    }

    pub fn with_broker(config: Config, broker: Arc<InMemoryBroker>) -> Self {
        let clock = TestClock::new();
        let store = InMemoryLogStore::new();
        let breaker = Arc::new(CircuitBreaker::new(
            "log-store",
            CircuitConfig::default(),
            Arc::new(clock.clone()),
        ));
        let state = AppState::new(
            &config,
            broker.clone(),
            Arc::new(store.clone()),
            breaker.clone(),
            Arc::new(clock.clone()),
        );

        Self { router: create_router(state), broker, store, breaker, clock }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// POST /api/logs with a valid key and no trace id.
pub fn log_request() -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri("/api/logs")
        .header("content-type", "application/json")
        .header("x-api-key", API_KEY)
}

pub fn post_log(body: &str) -> Request<Body> {
    log_request().header("x-trace-id", "trace-from-test").body(Body::from(body.to_string())).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

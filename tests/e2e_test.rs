//! End-to-end tests from HTTP ingestion to the document store.
//!
//! Runs the router, the delivery engine and the dead-letter listener
//! against a mock document store, with a test clock so retry waits are
//! instant.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use docore_api::{create_router, AppState, Config};
use docore_core::{BrokerConfig, InMemoryBroker, TestClock};
use docore_delivery::{
    circuit::CircuitBreaker,
    client::DocumentStoreClient,
    handler::StoreWriteHandler,
    sink::{DeadLetterListener, ErrorRecordSink},
    DeliveryEngine,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path_regex},
    Mock, MockServer, ResponseTemplate,
};

const API_KEY: &str = "e2e-key";

struct Pipeline {
    router: Router,
    engine: DeliveryEngine,
    listener: DeadLetterListener,
    store: MockServer,
}

impl Pipeline {
    async fn start(store: MockServer) -> Self {
        let config = Config {
            api_key: Some(API_KEY.to_string()),
            document_store_url: Some(store.uri()),
            store_timeout_seconds: 2,
            ..Config::default()
        };
        let clock = TestClock::new();

        let broker = Arc::new(InMemoryBroker::new(BrokerConfig::default()));
        broker.create_topic(&config.topic, config.topic_partitions).await.unwrap();
        broker.create_topic(&config.dead_letter_topic(), config.topic_partitions).await.unwrap();

        let client = Arc::new(DocumentStoreClient::new(config.to_store_config().unwrap()).unwrap());
        let breaker = Arc::new(CircuitBreaker::new(
            "log-store",
            config.to_circuit_config(),
            Arc::new(clock.clone()),
        ));
        let handler = Arc::new(StoreWriteHandler::new(client.clone(), breaker.clone()));

        let mut engine = DeliveryEngine::new(
            broker.clone(),
            config.to_delivery_config().unwrap(),
            handler,
            Arc::new(clock.clone()),
        );
        engine.start().await.unwrap();

        let sink = Arc::new(ErrorRecordSink::new(client.clone(), Arc::new(clock.clone())));
        let listener = DeadLetterListener::start(
            &broker,
            &config.dead_letter_topic(),
            sink,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let state = AppState::new(&config, broker, client, breaker, Arc::new(clock));
        Self { router: create_router(state), engine, listener, store }
    }

    async fn ingest(&self, body: &str) -> StatusCode {
        let request = Request::builder()
            .method("POST")
            .uri("/api/logs")
            .header("content-type", "application/json")
            .header("x-api-key", API_KEY)
            .header("x-trace-id", "trace-e2e")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap().status()
    }

    /// Waits until `count` requests hit paths starting with `prefix`.
    async fn wait_for_puts(&self, prefix: &str, count: usize) -> Vec<wiremock::Request> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let requests: Vec<_> = self
                    .store
                    .received_requests()
                    .await
                    .unwrap()
                    .into_iter()
                    .filter(|r| r.url.path().starts_with(prefix))
                    .collect();
                if requests.len() >= count {
                    return requests;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn stop(self) {
        self.engine.shutdown().await.unwrap();
        self.listener.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}

#[tokio::test]
async fn ingested_logs_are_indexed() {
    let store = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/app-logs/_doc/"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&store)
        .await;
    let pipeline = Pipeline::start(store).await;

    for service in ["auth", "billing", "search"] {
        let body = format!(r#"{{"serviceName":"{service}","logLevel":"INFO","message":"started"}}"#);
        assert_eq!(pipeline.ingest(&body).await, StatusCode::OK);
    }

    let puts = pipeline.wait_for_puts("/app-logs/", 3).await;
    let mut services: Vec<String> = puts
        .iter()
        .map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).unwrap())
        .map(|doc| {
            assert!(doc["timestamp"].is_string());
            doc["serviceName"].as_str().unwrap().to_string()
        })
        .collect();
    services.sort();
    assert_eq!(services, vec!["auth", "billing", "search"]);

    pipeline.stop().await;
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let store = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/app-logs/_doc/"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&store)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/app-logs/_doc/"))
        .respond_with(ResponseTemplate::new(201))
        .with_priority(2)
        .mount(&store)
        .await;
    let pipeline = Pipeline::start(store).await;

    let status = pipeline.ingest(r#"{"serviceName":"auth","logLevel":"ERROR","message":"boom"}"#).await;
    assert_eq!(status, StatusCode::OK);

    let puts = pipeline.wait_for_puts("/app-logs/", 3).await;
    assert_eq!(puts.len(), 3);

    // Give a stray dead-letter a chance to show up before asserting none did.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let error_puts = pipeline
        .store
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path().starts_with("/docore-error-logs/"))
        .count();
    assert_eq!(error_puts, 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn exhausted_logs_become_error_records() {
    let store = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/app-logs/_doc/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&store)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/docore-error-logs/_doc/"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&store)
        .await;
    let pipeline = Pipeline::start(store).await;

    let status = pipeline.ingest(r#"{"serviceName":"auth","logLevel":"ERROR","message":"boom"}"#).await;
    assert_eq!(status, StatusCode::OK, "ingress never sees downstream failures");

    let records = pipeline.wait_for_puts("/docore-error-logs/", 1).await;
    let record: serde_json::Value = serde_json::from_slice(&records[0].body).unwrap();

    assert_eq!(record["failureReason"], "TransientDependencyFailure");
    assert_eq!(record["traceId"], "trace-e2e");
    let original: serde_json::Value =
        serde_json::from_str(record["originalPayload"].as_str().unwrap()).unwrap();
    assert_eq!(original["serviceName"], "auth");
    assert_eq!(original["message"], "boom");

    let log_puts = pipeline.wait_for_puts("/app-logs/", 3).await;
    assert_eq!(log_puts.len(), 3);

    pipeline.stop().await;
}

//! Graceful shutdown: grace period, cancellation, refusal of new work.

mod common;

use common::*;
use graphql_stream_gateway::{GatewayConfig, ShutdownTrigger};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;

const EMPLOYEES: &str = "{ employees { id } }";

async fn wait_in_flight(fx: &Fixture, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while fx.registry.current().lifecycle().in_flight() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("requests never became in-flight");
}

fn spawn_requests(fx: &Fixture, count: usize) -> Vec<tokio::task::JoinHandle<axum::response::Response>> {
    (0..count)
        .map(|_| {
            let router = fx.router.clone();
            tokio::spawn(async move {
                router
                    .oneshot(graphql_post(json!({ "query": EMPLOYEES })))
                    .await
                    .unwrap()
            })
        })
        .collect()
}

#[tokio::test]
async fn test_requests_within_grace_period_complete() {
    let config = GatewayConfig::default().with_grace_period(Duration::from_secs(2));
    let fx = fixture_with_delay(config, Duration::from_millis(200)).await;

    let requests = spawn_requests(&fx, 3);
    wait_in_flight(&fx, 3).await;

    let report = fx.registry.shutdown().await;
    assert!(report.clean);
    assert_eq!(report.cancelled_requests, 0);

    for handle in requests {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), 200);
        let body = body_json(response).await;
        assert_eq!(body["data"]["employees"][2]["id"], 3);
    }
}

#[tokio::test]
async fn test_requests_past_grace_period_are_cancelled() {
    let config = GatewayConfig::default().with_grace_period(Duration::from_millis(200));
    let fx = fixture_with_delay(config, Duration::from_secs(10)).await;

    let requests = spawn_requests(&fx, 2);
    wait_in_flight(&fx, 2).await;

    let report = tokio::time::timeout(Duration::from_secs(3), fx.registry.shutdown())
        .await
        .expect("shutdown exceeded grace period");
    assert!(!report.clean);
    assert_eq!(report.cancelled_requests, 2);

    for handle in requests {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), 200);
        let body = body_json(response).await;
        assert_eq!(
            body["errors"][0]["message"],
            "Failed to fetch from Subgraph: request cancelled"
        );
    }
}

#[tokio::test]
async fn test_new_work_is_refused_after_shutdown() {
    let fx = fixture(GatewayConfig::default().with_grace_period(Duration::from_millis(100))).await;
    fx.registry.shutdown().await;

    let response = fx
        .router
        .clone()
        .oneshot(graphql_post(json!({ "query": EMPLOYEES })))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let response = fx
        .router
        .clone()
        .oneshot(streaming_post(
            "subscription { employeeUpdated(employeeID: 1) { id } }",
            "text/event-stream",
            "/graphql",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let response = fx
        .router
        .oneshot(
            axum::http::Request::builder()
                .uri("/ready")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn test_shutdown_closes_streams() {
    let fx = fixture(GatewayConfig::default().with_grace_period(Duration::from_millis(100))).await;

    let response = fx
        .router
        .clone()
        .oneshot(streaming_post(
            "subscription { employeeUpdated(employeeID: 1) { id } }",
            "text/event-stream",
            "/graphql",
        ))
        .await
        .unwrap();
    assert!(
        fx.broker
            .wait_for_subscribers("employeeUpdated.1", 1, Duration::from_secs(1))
            .await
    );

    let report = fx.registry.shutdown().await;
    assert_eq!(report.closed_sessions, 1);
    assert!(BodyReader::new(response)
        .finish(Duration::from_secs(2))
        .await
        .is_err());
}

#[tokio::test]
async fn test_serve_drains_on_trigger() {
    let config = GatewayConfig::default().with_grace_period(Duration::from_secs(2));
    let broker = std::sync::Arc::new(graphql_stream_gateway::InMemoryAdapter::new(PROVIDER));
    let gateway = graphql_stream_gateway::Gateway::builder()
        .with_config(config)
        .with_generation_builder(std::sync::Arc::new(FixtureBuilder::new(
            broker,
            Duration::from_millis(300),
        )))
        .with_snapshot(snapshot("v1"))
        .build()
        .await
        .unwrap();
    let registry = gateway.registry().clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let trigger = ShutdownTrigger::new();
    let server = tokio::spawn(gateway.serve_with_listener(listener, trigger.triggered()));

    // One request in flight over a real connection when the trigger fires.
    let request = tokio::spawn(async move {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let body = json!({ "query": EMPLOYEES }).to_string();
        let raw = format!(
            "POST /graphql HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    });

    tokio::time::timeout(Duration::from_secs(2), async {
        while registry.current().lifecycle().in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    trigger.trigger();

    let report = server.await.unwrap().unwrap();
    assert!(report.clean);
    let response = request.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"employees\""));
}

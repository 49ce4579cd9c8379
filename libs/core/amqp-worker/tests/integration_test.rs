//! Integration tests against a real RabbitMQ broker
//!
//! These tests start RabbitMQ via testcontainers to ensure:
//! - Replies carry the request's correlation id
//! - Malformed requests produce error replies
//! - Concurrent callers never receive each other's replies
//! - Shutdown drains in-flight messages before closing

use amqp_worker::{
    AmqpWorker, EchoHandler, RpcClient, RpcConfig, WorkerConfig, WorkerPhase, send_request,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRabbitMq};

async fn start_worker(url: &str, queue: &str, delay: Duration) -> AmqpWorker<EchoHandler> {
    let worker = AmqpWorker::connect(
        url,
        WorkerConfig::new(queue).with_prefetch(10),
        EchoHandler::with_delay(delay),
    )
    .await
    .expect("Failed to connect worker");
    worker.run().await.expect("Failed to start worker");
    worker
}

fn rpc_config(queue: &str) -> RpcConfig {
    RpcConfig::new(queue).with_timeout(Duration::from_secs(10))
}

// ============================================================================
// Request/Reply
// ============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn test_round_trip_preserves_correlation_id() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("round_trip");
    let queue = builder.queue_name("jobs");
    let worker = start_worker(rabbit.url(), &queue, Duration::ZERO).await;

    let client = RpcClient::connect(rabbit.url(), rpc_config(&queue))
        .await
        .unwrap();
    let reply = client
        .request(br#"{"test":"hello","value":42}"#.to_vec(), "C1")
        .await
        .unwrap();

    assert!(reply.is_success());
    assert_eq!(reply.data(), Some(&json!({"test": "hello", "value": 42})));

    client.close().await;
    worker.stop().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_invalid_json_returns_error_reply() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("invalid_json");
    let queue = builder.queue_name("jobs");
    let worker = start_worker(rabbit.url(), &queue, Duration::ZERO).await;

    let reply = send_request(rabbit.url(), rpc_config(&queue), "{not json")
        .await
        .unwrap();

    let error = reply.error().expect("expected an error reply");
    assert_eq!(error.kind, "DecodeError");
    assert!(!error.message.is_empty());

    worker.stop().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_concurrent_requests_are_correlated() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("concurrent_requests");
    let queue = builder.queue_name("jobs");
    let worker = start_worker(rabbit.url(), &queue, Duration::from_millis(100)).await;

    let client = RpcClient::connect(rabbit.url(), rpc_config(&queue))
        .await
        .unwrap();

    let ids = [
        builder.correlation_id(1),
        builder.correlation_id(2),
        builder.correlation_id(3),
    ];
    let (a, b, c) = tokio::join!(
        client.request(br#"{"n":1}"#.to_vec(), &ids[0]),
        client.request(br#"{"n":2}"#.to_vec(), &ids[1]),
        client.request(br#"{"n":3}"#.to_vec(), &ids[2]),
    );

    assert_eq!(a.unwrap().data(), Some(&json!({"n": 1})));
    assert_eq!(b.unwrap().data(), Some(&json!({"n": 2})));
    assert_eq!(c.unwrap().data(), Some(&json!({"n": 3})));

    client.close().await;
    worker.stop().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_request_without_worker_times_out() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("timeout");

    let config = RpcConfig::new(builder.queue_name("nobody-home"))
        .with_timeout(Duration::from_millis(500));
    let err = send_request(rabbit.url(), config, "{}").await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "Request timeout after 500ms");
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn test_stop_drains_in_flight_messages() {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("drain");
    let queue = builder.queue_name("jobs");
    let worker = Arc::new(start_worker(rabbit.url(), &queue, Duration::from_millis(500)).await);

    let client = Arc::new(
        RpcClient::connect(rabbit.url(), rpc_config(&queue))
            .await
            .unwrap(),
    );
    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call(&json!({ "i": i })).await })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while worker.state().in_flight() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("messages were never admitted");

    worker.stop().await;
    assert_eq!(worker.state().in_flight(), 0);
    assert_eq!(worker.state().phase(), WorkerPhase::Closed);

    for call in calls {
        assert!(call.await.unwrap().unwrap().is_success());
    }
    client.close().await;
}

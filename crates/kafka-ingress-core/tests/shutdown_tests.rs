//! Integration tests for graceful server shutdown.

use std::time::Duration;

use kafka_ingress_core::config::ThroughputConfig;
use kafka_ingress_core::testing::{IngressHarnessBuilder, IngressTestHarness, KafkaTestClient};
use kafka_protocol::messages::ApiKey;

const LONG: Duration = Duration::from_secs(2);

fn dispatched(harness: &IngressTestHarness) -> Vec<i32> {
    harness
        .handler
        .calls()
        .iter()
        .map(|c| c.correlation_id)
        .collect()
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_requests() {
    let harness = IngressTestHarness::new().await;
    let hold = harness.handler.hold(1);
    let mut client = harness.connect().await;

    client.send(ApiKey::Produce, 3, 1, b"pending").await.unwrap();
    for _ in 0..400 {
        if !harness.handler.calls().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.handler.calls().len(), 1);

    harness.server.shutdown_input();
    assert!(harness.server.is_shutting_down());

    let server = harness.server.clone();
    let mut stopped = tokio::spawn(async move { server.wait_for_shutdown().await });
    assert!(tokio::time::timeout(Duration::from_millis(100), &mut stopped)
        .await
        .is_err());

    hold.release();
    let response = client.recv_timeout(LONG).await.unwrap();
    assert_eq!(response.correlation_id, 1);
    assert_eq!(&response.body[..], b"pending");

    tokio::time::timeout(LONG, stopped)
        .await
        .expect("shutdown did not finish")
        .unwrap();
    assert!(client.is_closed_within(LONG).await);
    assert!(harness.server.connections().is_empty());
    assert_eq!(harness.metrics.active_connections.get(), 0);
}

#[tokio::test]
async fn test_no_connections_accepted_after_shutdown() {
    let harness = IngressTestHarness::new().await;
    let address = harness.address();

    harness.shutdown().await;
    assert!(KafkaTestClient::connect(address).await.is_err());
}

#[tokio::test]
async fn test_requests_after_input_shutdown_are_not_dispatched() {
    let harness = IngressTestHarness::new().await;
    let mut client = harness.connect().await;
    client.request(ApiKey::Produce, 3, 1, b"before").await.unwrap();

    harness.server.shutdown_input();
    let _ = client.send(ApiKey::Produce, 3, 2, b"after").await;

    harness.server.wait_for_shutdown().await;
    assert!(client.is_closed_within(LONG).await);

    assert_eq!(dispatched(&harness), vec![1]);
}

#[tokio::test]
async fn test_stop_after_input_shutdown_is_noop() {
    let harness = IngressTestHarness::new().await;
    harness.server.shutdown_input();

    tokio::time::timeout(LONG, harness.server.stop())
        .await
        .expect("stop should return immediately");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_throttle_sleep() {
    let harness = IngressHarnessBuilder::new()
        .throughput(ThroughputConfig {
            target_bytes_per_sec: 100,
            window_ms: 1_000,
            num_windows: 1,
            max_delay_ms: 10_000,
            gc_interval_ms: 60_000,
        })
        .build()
        .await;
    let mut client = harness.connect().await;
    let body = vec![0u8; 200];

    client.request(ApiKey::Produce, 3, 1, &body).await.unwrap();

    // Second violation: the pipeline sleeps for seconds before admitting it.
    client.send(ApiKey::Produce, 3, 2, &body).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatched(&harness), vec![1]);

    tokio::time::timeout(LONG, harness.server.wait_for_shutdown())
        .await
        .expect("shutdown waited out the throttle delay");
    assert!(client.is_closed_within(LONG).await);
    assert_eq!(dispatched(&harness), vec![1]);
}

#[tokio::test]
async fn test_shutdown_abandons_request_waiting_for_memory() {
    let harness = IngressHarnessBuilder::new()
        .memory_budget(16 * 1024)
        .memory_estimate(16 * 1024)
        .build()
        .await;
    let hold = harness.handler.hold(1);
    let mut client = harness.connect().await;

    client.send(ApiKey::Produce, 3, 1, b"holds the budget").await.unwrap();
    client.send(ApiKey::Produce, 3, 2, b"waits").await.unwrap();
    for _ in 0..400 {
        if harness.metrics.waiting_for_memory.get() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.metrics.waiting_for_memory.get(), 1);

    harness.server.shutdown_input();
    hold.release();

    let response = client.recv_timeout(LONG).await.unwrap();
    assert_eq!(response.correlation_id, 1);
    tokio::time::timeout(LONG, harness.server.wait_for_shutdown())
        .await
        .expect("shutdown did not finish");

    assert_eq!(dispatched(&harness), vec![1]);
    let budgets = harness.server.admission().budgets();
    assert_eq!(budgets.available_memory(), budgets.memory_capacity());
}

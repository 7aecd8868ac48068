//! Integration tests for the per-connection request pipeline.
//!
//! Each test starts a loopback server backed by a [`ScriptedHandler`] and
//! talks to it with raw Kafka framing.

use std::time::Duration;

use kafka_ingress_core::admission::MAX_REQUEST_ESTIMATE;
use kafka_ingress_core::testing::{IngressHarnessBuilder, IngressTestHarness};
use kafka_protocol::messages::ApiKey;

const SHORT: Duration = Duration::from_millis(100);
const LONG: Duration = Duration::from_secs(2);

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_response_carries_request_identity() {
    let harness = IngressTestHarness::new().await;
    let mut client = harness.connect().await.with_client_id(Some("c1"));

    let body = vec![7u8; 64];
    let response = client.request(ApiKey::Produce, 3, 5, &body).await.unwrap();
    assert_eq!(response.correlation_id, 5);
    assert_eq!(&response.body[..], &body[..]);

    let calls = harness.handler.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].api_key, ApiKey::Produce as i16);
    assert_eq!(calls[0].api_version, 3);
    assert_eq!(calls[0].client_id.as_deref(), Some("c1"));
    assert_eq!(calls[0].sequence_id, Some(0));
    assert_eq!(calls[0].body.len(), 64);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_responses_in_request_order() {
    let harness = IngressTestHarness::new().await;
    let hold_first = harness.handler.hold(1);
    let mut client = harness.connect().await;

    client.send(ApiKey::Produce, 3, 1, b"first").await.unwrap();
    client.send(ApiKey::Fetch, 4, 2, b"second").await.unwrap();

    // The second response is ready but must wait for the first.
    assert!(client.recv_timeout(SHORT).await.is_err());

    hold_first.release();
    let first = client.recv_timeout(LONG).await.unwrap();
    let second = client.recv_timeout(LONG).await.unwrap();
    assert_eq!(first.correlation_id, 1);
    assert_eq!(&first.body[..], b"first");
    assert_eq!(second.correlation_id, 2);
    assert_eq!(&second.body[..], b"second");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_sequence_ids_are_gapless() {
    let harness = IngressTestHarness::new().await;
    let releases: Vec<_> = (0..20).map(|i| harness.handler.hold(i)).collect();
    let mut client = harness.connect().await;

    for i in 0..20 {
        client.send(ApiKey::Produce, 3, i, b"x").await.unwrap();
    }
    assert!(eventually(|| harness.handler.calls().len() == 20).await);

    for release in releases.into_iter().rev() {
        release.release();
    }
    for i in 0..20 {
        let response = client.recv_timeout(LONG).await.unwrap();
        assert_eq!(response.correlation_id, i);
    }

    let sequence_ids: Vec<_> = harness
        .handler
        .calls()
        .iter()
        .map(|c| c.sequence_id)
        .collect();
    let expected: Vec<_> = (0..20).map(Some).collect();
    assert_eq!(sequence_ids, expected);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_oversized_estimate_closes_connection() {
    let harness = IngressHarnessBuilder::new()
        .memory_estimate(MAX_REQUEST_ESTIMATE)
        .build()
        .await;
    let mut client = harness.connect().await;

    client.send(ApiKey::Produce, 3, 1, b"big").await.unwrap();
    assert!(client.is_closed_within(LONG).await);
    assert!(harness.handler.calls().is_empty());
    assert_eq!(harness.metrics.oversized_requests.get(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_estimate_above_budget_is_clamped() {
    let harness = IngressHarnessBuilder::new()
        .memory_budget(16 * 1024)
        .memory_estimate(64 * 1024)
        .build()
        .await;
    let mut client = harness.connect().await;

    let response = client.request(ApiKey::Produce, 3, 1, b"ok").await.unwrap();
    assert_eq!(response.correlation_id, 1);
    assert_eq!(harness.metrics.oversized_requests.get(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_memory_budget_backpressure() {
    let harness = IngressHarnessBuilder::new()
        .memory_budget(10_000)
        .memory_estimate(8_000)
        .build()
        .await;
    let hold_first = harness.handler.hold(1);
    let mut client = harness.connect().await;

    client.send(ApiKey::Produce, 3, 1, b"a").await.unwrap();
    client.send(ApiKey::Produce, 3, 2, b"b").await.unwrap();

    assert!(eventually(|| harness.metrics.waiting_for_memory.get() == 1).await);
    assert_eq!(harness.handler.calls().len(), 1);

    hold_first.release();
    assert_eq!(client.recv_timeout(LONG).await.unwrap().correlation_id, 1);
    assert_eq!(client.recv_timeout(LONG).await.unwrap().correlation_id, 2);
    assert_eq!(harness.handler.calls().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_request_slots_bound_concurrency() {
    let harness = IngressHarnessBuilder::new()
        .max_concurrent_requests(1)
        .build()
        .await;
    let hold_first = harness.handler.hold(1);
    let mut client = harness.connect().await;

    client.send(ApiKey::Produce, 3, 1, b"a").await.unwrap();
    client.send(ApiKey::Produce, 3, 2, b"b").await.unwrap();

    tokio::time::sleep(SHORT).await;
    assert_eq!(harness.handler.calls().len(), 1);
    assert_eq!(harness.server.admission().budgets().available_slots(), 0);

    hold_first.release();
    assert_eq!(client.recv_timeout(LONG).await.unwrap().correlation_id, 1);
    assert_eq!(client.recv_timeout(LONG).await.unwrap().correlation_id, 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_noop_response_releases_resources() {
    let harness = IngressTestHarness::new().await;
    harness.handler.noop(1);
    let mut client = harness.connect().await;

    client.send(ApiKey::Produce, 0, 1, b"acks=0").await.unwrap();
    let response = client.request(ApiKey::Produce, 3, 2, b"acks=1").await.unwrap();
    assert_eq!(response.correlation_id, 2);

    let budgets = harness.server.admission().budgets();
    assert!(eventually(|| budgets.available_slots() == budgets.slot_capacity()).await);
    assert!(eventually(|| budgets.available_memory() == budgets.memory_capacity()).await);
    assert!(eventually(|| harness.metrics.in_flight_requests.get() == 0).await);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_failure_flushes_earlier_responses() {
    let harness = IngressTestHarness::new().await;
    let hold_first = harness.handler.hold(1);
    harness.handler.reject(2);
    let mut client = harness.connect().await;

    client.send(ApiKey::Produce, 3, 1, b"kept").await.unwrap();
    client.send(ApiKey::Produce, 3, 2, b"rejected").await.unwrap();

    assert!(eventually(|| harness.metrics.service_errors.get() == 1).await);
    hold_first.release();

    let response = client.recv_timeout(LONG).await.unwrap();
    assert_eq!(response.correlation_id, 1);
    assert!(client.is_closed_within(LONG).await);

    let dispatched: Vec<_> = harness
        .handler
        .calls()
        .iter()
        .map(|c| c.correlation_id)
        .collect();
    assert_eq!(dispatched, vec![1, 2]);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_processing_failure_closes_connection() {
    let harness = IngressTestHarness::new().await;
    harness.handler.fail(1);
    let mut client = harness.connect().await;

    client.send(ApiKey::Produce, 3, 1, b"boom").await.unwrap();
    assert!(client.is_closed_within(LONG).await);
    assert_eq!(harness.metrics.service_errors.get(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unknown_api_closes_connection() {
    let harness = IngressTestHarness::new().await;
    let mut client = harness.connect().await;

    client.send(ApiKey::Metadata, 9, 1, b"").await.unwrap();
    assert!(client.is_closed_within(LONG).await);
    assert_eq!(harness.metrics.service_errors.get(), 1);
    assert!(harness.handler.calls().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_corrupted_header_closes_connection() {
    let harness = IngressTestHarness::new().await;
    let mut client = harness.connect().await;

    // Frame of 3 bytes: too short for api key, version and correlation id.
    client.write_bytes(&[0, 0, 0, 3, 0, 0, 0]).await.unwrap();
    assert!(client.is_closed_within(LONG).await);
    assert_eq!(harness.metrics.corrupted_headers.get(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_connection_gauges_return_to_zero() {
    let harness = IngressTestHarness::new().await;
    {
        let mut client = harness.connect().await;
        client.request(ApiKey::Produce, 3, 1, b"x").await.unwrap();
        harness.wait_for_connections(1).await;
        assert_eq!(harness.metrics.active_connections.get(), 1);
    }

    harness.wait_for_connections(0).await;
    assert!(eventually(|| harness.metrics.active_connections.get() == 0).await);
    assert!(harness.metrics.bytes_received.get() > 0);
    assert!(harness.metrics.bytes_sent.get() > 0);

    harness.shutdown().await;
}

//! Integration tests for TLS listeners.

use std::io::Write;
use std::time::Duration;

use kafka_ingress_core::config::{ConnectionQuotaConfig, ServerTlsConfig};
use kafka_ingress_core::testing::tls::{insecure_client_config, TEST_CERT_PEM, TEST_KEY_PEM};
use kafka_ingress_core::testing::{IngressHarnessBuilder, IngressTestHarness, KafkaTestClient};
use kafka_protocol::messages::ApiKey;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const LONG: Duration = Duration::from_secs(2);

fn pem_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// TLS harness allowing two connections per IP. The returned files must
/// outlive the harness setup.
async fn tls_harness() -> (IngressTestHarness, NamedTempFile, NamedTempFile) {
    let cert = pem_file(TEST_CERT_PEM);
    let key = pem_file(TEST_KEY_PEM);
    let harness = IngressHarnessBuilder::new()
        .tls(ServerTlsConfig {
            cert_path: cert.path().to_path_buf(),
            key_path: key.path().to_path_buf(),
            ca_cert_path: None,
            require_client_cert: false,
            handshake_timeout_ms: 200,
        })
        .connection_quota(ConnectionQuotaConfig {
            max_connections: None,
            max_connections_per_ip: Some(2),
            overrides: vec![],
        })
        .build()
        .await;
    (harness, cert, key)
}

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
async fn test_request_over_tls() {
    let (harness, _cert, _key) = tls_harness().await;
    assert!(harness.server.listeners()[0].tls);

    let mut client = KafkaTestClient::connect_tls(harness.address(), insecure_client_config())
        .await
        .unwrap();
    let response = client
        .request(ApiKey::Produce, 3, 4, b"encrypted")
        .await
        .unwrap();
    assert_eq!(response.correlation_id, 4);
    assert_eq!(&response.body[..], b"encrypted");

    let connections = harness.server.connections();
    assert_eq!(connections.len(), 1);
    assert!(connections[0].tls);
    assert_eq!(
        harness
            .metrics
            .connections_accepted
            .with_label_values(&["test"])
            .get(),
        1
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_failed_handshake_releases_connection() {
    let (harness, _cert, _key) = tls_harness().await;
    let quota = harness.server.admission().connection_quota().unwrap();

    // Not a ClientHello.
    let mut garbage = KafkaTestClient::connect(harness.address()).await.unwrap();
    let _ = garbage.write_bytes(b"\0\0\0\x05hello").await;
    assert!(garbage.is_closed_within(LONG).await);
    assert!(eventually(|| quota.total_in_use() == 0).await);

    // Never starts the handshake: held until the handshake timeout.
    let mut silent = TcpStream::connect(harness.address()).await.unwrap();
    assert!(eventually(|| quota.total_in_use() == 1).await);
    assert!(eventually(|| quota.total_in_use() == 0).await);
    let _ = silent.shutdown().await;

    assert!(harness.server.connections().is_empty());
    assert_eq!(
        harness
            .metrics
            .connections_accepted
            .with_label_values(&["test"])
            .get(),
        0
    );

    // Quota units were returned, so both slots are free for real clients.
    let mut first = KafkaTestClient::connect_tls(harness.address(), insecure_client_config())
        .await
        .unwrap();
    let mut second = KafkaTestClient::connect_tls(harness.address(), insecure_client_config())
        .await
        .unwrap();
    assert_eq!(first.request(ApiKey::Produce, 3, 1, b"a").await.unwrap().correlation_id, 1);
    assert_eq!(second.request(ApiKey::Produce, 3, 1, b"b").await.unwrap().correlation_id, 1);

    harness.shutdown().await;
}

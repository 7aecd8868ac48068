//! Test utilities for the ingress tier.
//!
//! - [`KafkaTestClient`]: raw Kafka-framing client
//! - [`ScriptedHandler`]: echo handler whose completion the test controls
//! - [`IngressTestHarness`]: a loopback server wired to a scripted handler
//! - [`tls`]: a self-signed server identity and a client config that trusts it
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_ingress_core::testing::IngressTestHarness;
//! use kafka_protocol::messages::ApiKey;
//!
//! #[tokio::test]
//! async fn test_in_order() {
//!     let harness = IngressTestHarness::new().await;
//!     let release = harness.handler.hold(1);
//!
//!     let mut client = harness.connect().await;
//!     client.send(ApiKey::Produce, 3, 1, b"a").await.unwrap();
//!     client.send(ApiKey::Produce, 3, 2, b"b").await.unwrap();
//!     release.release();
//!
//!     assert_eq!(client.recv().await.unwrap().correlation_id, 1);
//! }
//! ```

pub mod client;
pub mod handlers;
pub mod harness;
pub mod tls;

pub use client::KafkaTestClient;
pub use handlers::{
    HandledRequest, PlainAuthenticateHandler, Release, SaslHandshakeHandler, ScriptedHandler,
};
pub use harness::{IngressHarnessBuilder, IngressTestHarness, LISTENER};

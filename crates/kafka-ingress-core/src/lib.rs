//! Kafka Ingress Core Library
//!
//! The client-facing tier of a Kafka-wire-compatible broker. It accepts
//! TCP/TLS connections, applies admission control, and runs a pipeline per
//! connection that reads requests in order, hands them to a dispatcher for
//! concurrent processing, and writes the responses back in request order.
//!
//! # Architecture
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`admission`] - Connection quota, connection rate, throughput throttle,
//!   memory and request-slot budgets
//! - [`network`] - Acceptor, wire framing and connections
//! - [`pipeline`] - Per-connection request pipeline and response reordering
//! - [`handlers`] - Dispatch interface and handler registry
//! - [`auth`] - Per-connection SASL state
//! - [`metrics`] - Prometheus metrics collection
//! - [`tls`] - Server-side TLS
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kafka_ingress_core::{HandlerRegistry, IngressConfig, IngressMetrics, IngressServer};
//!
//! let config = IngressConfig::from_file("config.yaml")?;
//! let server = IngressServer::new(
//!     config,
//!     Arc::new(HandlerRegistry::new()),
//!     Arc::new(IngressMetrics::new()),
//! )?;
//! server.start().await?;
//! // ...
//! server.wait_for_shutdown().await;
//! ```

#![forbid(unsafe_code)]

pub mod admission;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod network;
pub mod pipeline;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use admission::AdmissionController;
pub use auth::{AuthState, AuthStateObserver, SaslState};
pub use config::IngressConfig;
pub use error::{AdmissionError, ConfigError, IngressError, Result, TlsError};
pub use handlers::{HandlerRegistry, ProcessResult, ProtocolHandler, RequestDispatcher, Response};
pub use metrics::IngressMetrics;
pub use network::{Connection, ConnectionInfo, IngressServer, ListenerInfo};
pub use tls::TlsServerAcceptor;

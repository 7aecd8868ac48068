//! Test harness running a loopback [`IngressServer`].

use std::net::SocketAddr;
use std::sync::Arc;

use kafka_protocol::messages::ApiKey;

use crate::config::{
    AdmissionConfig, ConnectionQuotaConfig, ConnectionRateConfig, IngressConfig,
    ServerTlsConfig, ThroughputConfig,
};
use crate::handlers::HandlerRegistry;
use crate::metrics::IngressMetrics;
use crate::network::IngressServer;

use super::client::KafkaTestClient;
use super::handlers::{PlainAuthenticateHandler, SaslHandshakeHandler, ScriptedHandler};

/// Listener name used by the harness.
pub const LISTENER: &str = "test";

/// A started server with a [`ScriptedHandler`] registered for Produce and
/// Fetch.
pub struct IngressTestHarness {
    pub server: IngressServer,
    pub handler: Arc<ScriptedHandler>,
    pub metrics: Arc<IngressMetrics>,
    address: SocketAddr,
}

impl IngressTestHarness {
    /// Harness with default admission settings.
    pub async fn new() -> Self {
        IngressHarnessBuilder::new().build().await
    }

    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Open a client connection.
    pub async fn connect(&self) -> KafkaTestClient {
        KafkaTestClient::connect(self.address)
            .await
            .expect("Failed to connect to ingress")
    }

    /// Wait until the server tracks `count` connections.
    pub async fn wait_for_connections(&self, count: usize) {
        for _ in 0..200 {
            if self.server.connections().len() == count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} connections, found {}",
            self.server.connections().len()
        );
    }

    /// Shut the server down and wait for it.
    pub async fn shutdown(&self) {
        self.server.wait_for_shutdown().await;
    }
}

/// Builder for harnesses with specific admission settings.
pub struct IngressHarnessBuilder {
    config: IngressConfig,
    handler: ScriptedHandler,
    sasl: Option<(String, String)>,
}

impl IngressHarnessBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: IngressConfig::single_listener(LISTENER, "127.0.0.1:0"),
            handler: ScriptedHandler::new(),
            sasl: None,
        }
    }

    #[must_use]
    pub fn admission(mut self, admission: AdmissionConfig) -> Self {
        self.config.admission = admission;
        self
    }

    #[must_use]
    pub fn connection_quota(mut self, quota: ConnectionQuotaConfig) -> Self {
        self.config.admission.connection_quota = Some(quota);
        self
    }

    #[must_use]
    pub fn connection_rate(mut self, rate: ConnectionRateConfig) -> Self {
        self.config.admission.connection_rate = Some(rate);
        self
    }

    #[must_use]
    pub fn throughput(mut self, throughput: ThroughputConfig) -> Self {
        self.config.admission.throughput = Some(throughput);
        self
    }

    #[must_use]
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.config.admission.memory_budget_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_concurrent_requests(mut self, slots: usize) -> Self {
        self.config.admission.max_concurrent_requests = slots;
        self
    }

    /// Scripted handler reporting `estimate` bytes per request.
    #[must_use]
    pub fn memory_estimate(mut self, estimate: usize) -> Self {
        self.handler = ScriptedHandler::new().with_memory_estimate(estimate);
        self
    }

    /// Serve the listener over TLS.
    #[must_use]
    pub fn tls(mut self, tls: ServerTlsConfig) -> Self {
        for listener in &mut self.config.listeners {
            listener.tls = Some(tls.clone());
        }
        self
    }

    /// Require SASL PLAIN with these credentials.
    #[must_use]
    pub fn sasl_plain(mut self, username: &str, password: &str) -> Self {
        self.sasl = Some((username.to_string(), password.to_string()));
        self
    }

    /// Start the server.
    pub async fn build(mut self) -> IngressTestHarness {
        let handler = Arc::new(self.handler);
        let mut registry = HandlerRegistry::new();
        registry.register_arc(ApiKey::Produce, 0..=9, handler.clone());
        registry.register_arc(ApiKey::Fetch, 0..=13, handler.clone());

        if let Some((username, password)) = self.sasl {
            for listener in &mut self.config.listeners {
                listener.sasl = true;
            }
            registry.register(ApiKey::SaslHandshake, 0..=1, SaslHandshakeHandler);
            registry.register(
                ApiKey::SaslAuthenticate,
                0..=2,
                PlainAuthenticateHandler::new(username, password),
            );
        }

        let metrics = Arc::new(IngressMetrics::new());
        let server = IngressServer::new(self.config, Arc::new(registry), Arc::clone(&metrics))
            .expect("Invalid harness config");
        server.start().await.expect("Failed to start ingress");
        let address = server
            .local_addr(LISTENER)
            .expect("Harness listener not bound");

        IngressTestHarness {
            server,
            handler,
            metrics,
            address,
        }
    }
}

impl Default for IngressHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

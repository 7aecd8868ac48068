//! Prometheus metrics for the ingress tier.
//!
//! The acceptor and the per-connection pipeline share one [`IngressMetrics`]
//! per server. Counter names mirror the events the pipeline already has to
//! distinguish: rejected connections, rate-limit timeouts, corrupted
//! headers, service errors and memory waits.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Ingress metrics collection.
pub struct IngressMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Connections accepted and handed to a pipeline, by listener.
    pub connections_accepted: IntCounterVec,

    /// Connections closed by the connection quota before any read.
    pub connections_rejected: IntCounter,

    /// Connections dropped waiting for a connection-rate token.
    pub rate_limit_timeouts: IntCounter,

    /// Connections whose request header could not be parsed.
    pub corrupted_headers: IntCounter,

    /// Requests that failed in dispatch or in the handler.
    pub service_errors: IntCounter,

    /// Requests refused because their memory estimate hit the ceiling.
    pub oversized_requests: IntCounter,

    /// Requests that had to wait for the memory budget.
    pub waiting_for_memory: IntCounter,

    /// Requests fully processed (written or skipped), by API key.
    pub requests_completed: IntCounterVec,

    /// Request latency from admission to release, by API key.
    pub request_duration_seconds: HistogramVec,

    /// Current open connections.
    pub active_connections: IntGauge,

    /// Requests admitted but not yet released.
    pub in_flight_requests: IntGauge,

    /// Total bytes received from clients.
    pub bytes_received: IntCounter,

    /// Total bytes sent to clients.
    pub bytes_sent: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("metric creation should succeed");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration should succeed");
    metric
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let metric =
        IntCounterVec::new(Opts::new(name, help), labels).expect("metric creation should succeed");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration should succeed");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("metric creation should succeed");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration should succeed");
    metric
}

impl IngressMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kafka_ingress_request_duration_seconds",
                "Request latency from admission to release in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
            ]),
            &["api_key"],
        )
        .expect("metric creation should succeed");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("metric registration should succeed");

        Self {
            connections_accepted: counter_vec(
                &registry,
                "kafka_ingress_connections_accepted_total",
                "Connections accepted by listener",
                &["listener"],
            ),
            connections_rejected: counter(
                &registry,
                "kafka_ingress_connections_rejected_total",
                "Connections rejected by the connection quota",
            ),
            rate_limit_timeouts: counter(
                &registry,
                "kafka_ingress_connection_rate_timeouts_total",
                "Connections dropped waiting for the connection rate limiter",
            ),
            corrupted_headers: counter(
                &registry,
                "kafka_ingress_corrupted_headers_total",
                "Requests with an unparseable header",
            ),
            service_errors: counter(
                &registry,
                "kafka_ingress_service_errors_total",
                "Requests that failed in dispatch or processing",
            ),
            oversized_requests: counter(
                &registry,
                "kafka_ingress_oversized_requests_total",
                "Requests refused because their memory estimate reached the ceiling",
            ),
            waiting_for_memory: counter(
                &registry,
                "kafka_ingress_waiting_for_memory_total",
                "Requests that waited for the memory budget",
            ),
            requests_completed: counter_vec(
                &registry,
                "kafka_ingress_requests_completed_total",
                "Requests whose response was written or skipped, by API key",
                &["api_key"],
            ),
            request_duration_seconds,
            active_connections: gauge(
                &registry,
                "kafka_ingress_active_connections",
                "Current number of open client connections",
            ),
            in_flight_requests: gauge(
                &registry,
                "kafka_ingress_in_flight_requests",
                "Requests admitted and not yet released",
            ),
            bytes_received: counter(
                &registry,
                "kafka_ingress_bytes_received_total",
                "Total bytes received from clients",
            ),
            bytes_sent: counter(
                &registry,
                "kafka_ingress_bytes_sent_total",
                "Total bytes sent to clients",
            ),
            registry,
        }
    }

    /// Record an accepted connection on `listener`.
    pub fn record_connection_accepted(&self, listener: &str) {
        self.connections_accepted.with_label_values(&[listener]).inc();
    }

    /// Record a finished request.
    pub fn record_request_completed(&self, api_key: &str, duration_seconds: f64) {
        self.requests_completed.with_label_values(&[api_key]).inc();
        self.request_duration_seconds
            .with_label_values(&[api_key])
            .observe(duration_seconds);
    }

    /// Record bytes received.
    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.inc_by(bytes as u64);
    }

    /// Record bytes sent.
    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.inc_by(bytes as u64);
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for IngressMetrics {
    fn default() -> Self {
        Self::new()
    }
}

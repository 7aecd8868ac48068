//! Metrics collection for the ingress tier.
//!
//! Provides Prometheus-compatible counters and gauges for connection
//! admission, request pipelining and throughput.

pub mod prometheus;

pub use prometheus::IngressMetrics;

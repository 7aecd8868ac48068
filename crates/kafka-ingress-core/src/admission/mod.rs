//! Admission control.
//!
//! Independent gates a connection or request must clear:
//!
//! - [`ConnectionQuota`]: connection count per source and in total. Rejects
//!   before any byte is read.
//! - [`ConnectionRateLimiter`]: new-connection token bucket with subnet
//!   overrides. Drops the connection when the wait times out.
//! - [`ThroughputQuota`]: per-client byte rate. Delays, never rejects.
//! - [`RequestBudgets`]: memory and concurrent-request slots. Suspends,
//!   and only rejects estimates at the hard ceiling.

pub mod budget;
pub mod conn_quota;
pub mod conn_rate;
pub mod throughput;

use std::net::IpAddr;

pub use budget::{default_memory_estimate, RequestBudgets, MAX_REQUEST_ESTIMATE};
pub use conn_quota::{ConnectionQuota, ConnectionQuotaUnits};
pub use conn_rate::{ConnectionRateLimiter, SubnetOverride};
pub use throughput::{ThrottleDelay, ThroughputQuota};

use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, ConfigResult};

/// All admission gates of one server.
pub struct AdmissionController {
    conn_quota: Option<ConnectionQuota>,
    conn_rate: Option<ConnectionRateLimiter>,
    throughput: Option<ThroughputQuota>,
    budgets: RequestBudgets,
}

impl AdmissionController {
    /// Build the gates described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a subnet override cannot be parsed.
    pub fn from_config(config: &AdmissionConfig) -> ConfigResult<Self> {
        let conn_rate = match &config.connection_rate {
            Some(rate) => Some(ConnectionRateLimiter::new(
                rate.rate_per_sec,
                rate.subnet_overrides()?,
                rate.wait_timeout(),
            )),
            None => None,
        };

        Ok(Self {
            conn_quota: config.connection_quota.as_ref().map(ConnectionQuota::new),
            conn_rate,
            throughput: config.throughput.as_ref().map(ThroughputQuota::new),
            budgets: RequestBudgets::new(
                config.memory_budget_bytes,
                config.max_concurrent_requests,
            ),
        })
    }

    /// Reserve a connection unit for `ip`.
    ///
    /// Returns `Ok(None)` when no quota is configured.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::QuotaExhausted`] when the quota is full.
    pub fn reserve_connection(
        &self,
        ip: IpAddr,
    ) -> Result<Option<ConnectionQuotaUnits>, AdmissionError> {
        match &self.conn_quota {
            None => Ok(None),
            Some(quota) => quota
                .try_acquire(ip)
                .map(Some)
                .ok_or(AdmissionError::QuotaExhausted(ip)),
        }
    }

    /// Wait for a connection-rate token, if a limiter is configured.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::RateLimitTimeout`] on timeout.
    pub async fn wait_connection_rate(&self, ip: IpAddr) -> Result<(), AdmissionError> {
        match &self.conn_rate {
            Some(limiter) => limiter.maybe_wait(ip).await,
            None => Ok(()),
        }
    }

    /// Record a request against the client's throughput quota.
    #[must_use]
    pub fn throttle(&self, client_id: Option<&str>, request_size: usize) -> ThrottleDelay {
        self.throughput
            .as_ref()
            .map_or_else(ThrottleDelay::default, |q| q.record(client_id, request_size))
    }

    #[must_use]
    pub fn budgets(&self) -> &RequestBudgets {
        &self.budgets
    }

    #[must_use]
    pub fn connection_quota(&self) -> Option<&ConnectionQuota> {
        self.conn_quota.as_ref()
    }

    #[must_use]
    pub fn connection_rate(&self) -> Option<&ConnectionRateLimiter> {
        self.conn_rate.as_ref()
    }

    #[must_use]
    pub fn throughput(&self) -> Option<&ThroughputQuota> {
        self.throughput.as_ref()
    }

    /// Stop the rate limiter so no accept loop stays parked on it.
    pub fn stop(&self) {
        if let Some(limiter) = &self.conn_rate {
            limiter.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionQuotaConfig, ThroughputConfig};

    #[test]
    fn test_defaults_admit_everything_but_budgets() {
        let admission = AdmissionController::from_config(&AdmissionConfig::default()).unwrap();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        assert!(admission.reserve_connection(ip).unwrap().is_none());
        assert_eq!(admission.throttle(Some("c"), 1 << 30), ThrottleDelay::default());
        assert_eq!(admission.budgets().slot_capacity(), 4096);
    }

    #[test]
    fn test_quota_exhaustion_is_an_error() {
        let config = AdmissionConfig {
            connection_quota: Some(ConnectionQuotaConfig {
                max_connections: None,
                max_connections_per_ip: Some(1),
                overrides: vec![],
            }),
            ..AdmissionConfig::default()
        };
        let admission = AdmissionController::from_config(&config).unwrap();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let _held = admission.reserve_connection(ip).unwrap().unwrap();
        assert_eq!(
            admission.reserve_connection(ip).unwrap_err(),
            AdmissionError::QuotaExhausted(ip)
        );
    }

    #[test]
    fn test_throttle_uses_quota() {
        let config = AdmissionConfig {
            throughput: Some(ThroughputConfig {
                target_bytes_per_sec: 10,
                window_ms: 1_000,
                num_windows: 1,
                max_delay_ms: 1_000,
                gc_interval_ms: 1_000,
            }),
            ..AdmissionConfig::default()
        };
        let admission = AdmissionController::from_config(&config).unwrap();

        assert!(admission.throttle(Some("c"), 1_000).first_violation);
        assert!(admission.throttle(Some("c"), 1_000).effective() > std::time::Duration::ZERO);
    }
}

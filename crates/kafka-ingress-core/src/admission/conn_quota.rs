//! Connection count quota.
//!
//! Limits the number of open connections in total and per source address.
//! A reservation is an RAII [`ConnectionQuotaUnits`] that returns its unit
//! when dropped, so the count follows the connection's lifetime exactly.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::ConnectionQuotaConfig;

struct QuotaState {
    total_limit: Option<u32>,
    per_ip_limit: Option<u32>,
    overrides: HashMap<IpAddr, u32>,
    total: AtomicU32,
    per_ip: DashMap<IpAddr, u32>,
}

impl QuotaState {
    fn limit_for(&self, ip: IpAddr) -> Option<u32> {
        self.overrides.get(&ip).copied().or(self.per_ip_limit)
    }

    fn release(&self, ip: IpAddr) {
        if self.total_limit.is_some() {
            self.total.fetch_sub(1, Ordering::AcqRel);
        }
        if self.limit_for(ip).is_some() {
            if let Some(mut count) = self.per_ip.get_mut(&ip) {
                *count = count.saturating_sub(1);
            }
            self.per_ip.remove_if(&ip, |_, count| *count == 0);
        }
    }
}

/// Tracks open connections against the configured limits.
#[derive(Clone)]
pub struct ConnectionQuota {
    state: Arc<QuotaState>,
}

impl ConnectionQuota {
    #[must_use]
    pub fn new(config: &ConnectionQuotaConfig) -> Self {
        Self {
            state: Arc::new(QuotaState {
                total_limit: config.max_connections,
                per_ip_limit: config.max_connections_per_ip,
                overrides: config
                    .overrides
                    .iter()
                    .map(|o| (o.address, o.max_connections))
                    .collect(),
                total: AtomicU32::new(0),
                per_ip: DashMap::new(),
            }),
        }
    }

    /// Reserve one connection unit for `ip`.
    ///
    /// Returns `None` when either the total or the per-source limit is
    /// exhausted. Nothing is held in that case.
    #[must_use]
    pub fn try_acquire(&self, ip: IpAddr) -> Option<ConnectionQuotaUnits> {
        let state = &self.state;

        if let Some(limit) = state.total_limit {
            let reserved = state
                .total
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                });
            if reserved.is_err() {
                debug!(%ip, limit, "total connection limit reached");
                return None;
            }
        }

        if let Some(limit) = state.limit_for(ip) {
            let mut count = state.per_ip.entry(ip).or_insert(0);
            if *count >= limit {
                drop(count);
                if state.total_limit.is_some() {
                    state.total.fetch_sub(1, Ordering::AcqRel);
                }
                state.per_ip.remove_if(&ip, |_, c| *c == 0);
                debug!(%ip, limit, "per-source connection limit reached");
                return None;
            }
            *count += 1;
        }

        Some(ConnectionQuotaUnits {
            state: Arc::clone(&self.state),
            ip,
        })
    }

    /// Connections currently held for `ip`. Only counted when a per-source
    /// limit applies to it.
    #[must_use]
    pub fn in_use(&self, ip: IpAddr) -> u32 {
        self.state.per_ip.get(&ip).map_or(0, |c| *c)
    }

    /// Connections currently held in total. Only counted when a total limit
    /// is configured.
    #[must_use]
    pub fn total_in_use(&self) -> u32 {
        self.state.total.load(Ordering::Acquire)
    }
}

/// One reserved connection unit. Released on drop.
pub struct ConnectionQuotaUnits {
    state: Arc<QuotaState>,
    ip: IpAddr,
}

impl ConnectionQuotaUnits {
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionQuotaUnits {
    fn drop(&mut self) {
        self.state.release(self.ip);
    }
}

impl std::fmt::Debug for ConnectionQuotaUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionQuotaUnits")
            .field("ip", &self.ip)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpLimitOverride;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_per_ip_limit() {
        let quota = ConnectionQuota::new(&ConnectionQuotaConfig {
            max_connections: None,
            max_connections_per_ip: Some(2),
            overrides: vec![],
        });

        let a = quota.try_acquire(ip("10.0.0.1")).unwrap();
        let _b = quota.try_acquire(ip("10.0.0.1")).unwrap();
        assert!(quota.try_acquire(ip("10.0.0.1")).is_none());
        assert_eq!(quota.in_use(ip("10.0.0.1")), 2);

        // Other sources are unaffected.
        assert!(quota.try_acquire(ip("10.0.0.2")).is_some());

        drop(a);
        assert_eq!(quota.in_use(ip("10.0.0.1")), 1);
        assert!(quota.try_acquire(ip("10.0.0.1")).is_some());
    }

    #[test]
    fn test_total_limit() {
        let quota = ConnectionQuota::new(&ConnectionQuotaConfig {
            max_connections: Some(2),
            max_connections_per_ip: None,
            overrides: vec![],
        });

        let _a = quota.try_acquire(ip("10.0.0.1")).unwrap();
        let b = quota.try_acquire(ip("10.0.0.2")).unwrap();
        assert!(quota.try_acquire(ip("10.0.0.3")).is_none());
        assert_eq!(quota.total_in_use(), 2);

        drop(b);
        assert!(quota.try_acquire(ip("10.0.0.3")).is_some());
    }

    #[test]
    fn test_override_replaces_per_ip_limit() {
        let quota = ConnectionQuota::new(&ConnectionQuotaConfig {
            max_connections: None,
            max_connections_per_ip: Some(1),
            overrides: vec![IpLimitOverride {
                address: ip("192.168.1.5"),
                max_connections: 3,
            }],
        });

        let held: Vec<_> = (0..3)
            .map(|_| quota.try_acquire(ip("192.168.1.5")))
            .collect();
        assert!(held.iter().all(Option::is_some));
        assert!(quota.try_acquire(ip("192.168.1.5")).is_none());

        let _one = quota.try_acquire(ip("192.168.1.6")).unwrap();
        assert!(quota.try_acquire(ip("192.168.1.6")).is_none());
    }

    #[test]
    fn test_per_ip_rejection_returns_total_unit() {
        let quota = ConnectionQuota::new(&ConnectionQuotaConfig {
            max_connections: Some(10),
            max_connections_per_ip: Some(1),
            overrides: vec![],
        });

        let _a = quota.try_acquire(ip("10.0.0.1")).unwrap();
        assert!(quota.try_acquire(ip("10.0.0.1")).is_none());
        assert_eq!(quota.total_in_use(), 1);
    }

    #[test]
    fn test_entries_removed_when_idle() {
        let quota = ConnectionQuota::new(&ConnectionQuotaConfig {
            max_connections: None,
            max_connections_per_ip: Some(5),
            overrides: vec![],
        });

        drop(quota.try_acquire(ip("10.0.0.1")));
        assert_eq!(quota.in_use(ip("10.0.0.1")), 0);
        assert!(quota.state.per_ip.is_empty());
    }
}

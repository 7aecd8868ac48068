//! Per-client throughput throttling.
//!
//! Each client id gets a ring of fixed-width byte-count windows. The observed
//! rate over the ring is compared with the target and any overshoot turns
//! into a delay proportional to it. Throttling never rejects a request.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ThroughputConfig;

/// Outcome of recording one request against a client's quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleDelay {
    /// Delay the request should observe.
    pub delay: Duration,
    /// True when this is the first over-quota request after a compliant one.
    pub first_violation: bool,
}

impl ThrottleDelay {
    /// The delay the pipeline should actually sleep. The first violation is
    /// let through immediately; the next offending request pays.
    #[must_use]
    pub fn effective(&self) -> Duration {
        if self.first_violation {
            Duration::ZERO
        } else {
            self.delay
        }
    }
}

#[derive(Debug)]
struct ClientWindows {
    /// (window index, bytes) pairs, oldest first.
    windows: VecDeque<(u64, u64)>,
    last_delay: Duration,
    last_seen: Instant,
}

/// Windowed byte-rate tracker keyed by client id.
pub struct ThroughputQuota {
    target_bytes_per_sec: u64,
    window: Duration,
    num_windows: usize,
    max_delay: Duration,
    epoch: Instant,
    clients: DashMap<String, ClientWindows>,
}

impl ThroughputQuota {
    #[must_use]
    pub fn new(config: &ThroughputConfig) -> Self {
        Self {
            target_bytes_per_sec: config.target_bytes_per_sec,
            window: Duration::from_millis(config.window_ms.max(1)),
            num_windows: config.num_windows.max(1),
            max_delay: Duration::from_millis(config.max_delay_ms),
            epoch: Instant::now(),
            clients: DashMap::new(),
        }
    }

    fn span(&self) -> Duration {
        self.window * self.num_windows as u32
    }

    fn window_index(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch);
        (elapsed.as_millis() / self.window.as_millis()) as u64
    }

    /// Record `bytes` for `client_id` and compute the resulting delay.
    pub fn record(&self, client_id: Option<&str>, bytes: usize) -> ThrottleDelay {
        self.record_at(client_id, bytes, Instant::now())
    }

    /// [`record`](Self::record) with an explicit clock reading.
    pub fn record_at(&self, client_id: Option<&str>, bytes: usize, now: Instant) -> ThrottleDelay {
        let index = self.window_index(now);
        let oldest = index.saturating_sub(self.num_windows as u64 - 1);

        let mut entry = self
            .clients
            .entry(client_id.unwrap_or_default().to_string())
            .or_insert_with(|| ClientWindows {
                windows: VecDeque::with_capacity(self.num_windows),
                last_delay: Duration::ZERO,
                last_seen: now,
            });
        let client = entry.value_mut();
        client.last_seen = now;

        while client.windows.front().is_some_and(|(i, _)| *i < oldest) {
            client.windows.pop_front();
        }
        match client.windows.back_mut() {
            Some((i, total)) if *i == index => *total += bytes as u64,
            _ => client.windows.push_back((index, bytes as u64)),
        }

        let total: u64 = client.windows.iter().map(|(_, b)| b).sum();
        let delay = self.delay_for(total);
        let first_violation = !delay.is_zero() && client.last_delay.is_zero();
        client.last_delay = delay;

        ThrottleDelay {
            delay,
            first_violation,
        }
    }

    fn delay_for(&self, total_bytes: u64) -> Duration {
        let span = self.span();
        let rate = total_bytes as f64 / span.as_secs_f64();
        let target = self.target_bytes_per_sec as f64;
        if rate <= target {
            return Duration::ZERO;
        }
        let delay = span.mul_f64((rate - target) / target);
        delay.min(self.max_delay)
    }

    /// Drop clients idle for longer than the accounting span. Returns how
    /// many were removed.
    pub fn gc(&self) -> usize {
        self.gc_at(Instant::now())
    }

    /// [`gc`](Self::gc) with an explicit clock reading.
    pub fn gc_at(&self, now: Instant) -> usize {
        let idle = self.span().max(self.max_delay);
        let before = self.clients.len();
        self.clients
            .retain(|_, c| now.saturating_duration_since(c.last_seen) <= idle);
        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            debug!(removed, "collected idle throughput quota entries");
        }
        removed
    }

    /// Number of tracked clients.
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

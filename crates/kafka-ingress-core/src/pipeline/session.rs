//! Per-request resources held from admission until the response is written.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::OwnedSemaphorePermit;

use crate::metrics::IngressMetrics;

/// Tracks one in-flight request for metrics.
///
/// Counts the request as in flight while alive; on drop records it as
/// completed along with its latency.
pub struct RequestTracker {
    metrics: Arc<IngressMetrics>,
    api_key: String,
    started: Instant,
}

impl RequestTracker {
    pub fn new(metrics: Arc<IngressMetrics>, api_key: impl Into<String>) -> Self {
        metrics.in_flight_requests.inc();
        Self {
            metrics,
            api_key: api_key.into(),
            started: Instant::now(),
        }
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        self.metrics.in_flight_requests.dec();
        self.metrics
            .record_request_completed(&self.api_key, self.started.elapsed().as_secs_f64());
    }
}

/// Resources reserved for one admitted request.
///
/// Dropping the value releases the memory and slot reservations, which
/// makes the release happen exactly once.
pub struct SessionResources {
    throttle_delay: Duration,
    memory_units: u32,
    _memory: OwnedSemaphorePermit,
    _slot: OwnedSemaphorePermit,
    tracker: RequestTracker,
}

impl SessionResources {
    #[must_use]
    pub fn new(
        throttle_delay: Duration,
        memory: OwnedSemaphorePermit,
        slot: OwnedSemaphorePermit,
        tracker: RequestTracker,
    ) -> Self {
        Self {
            throttle_delay,
            memory_units: memory.num_permits() as u32,
            _memory: memory,
            _slot: slot,
            tracker,
        }
    }

    #[must_use]
    pub fn throttle_delay(&self) -> Duration {
        self.throttle_delay
    }

    #[must_use]
    pub fn memory_units(&self) -> u32 {
        self.memory_units
    }

    /// Release everything now.
    pub fn release(self) {}
}

impl std::fmt::Debug for SessionResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResources")
            .field("throttle_delay", &self.throttle_delay)
            .field("memory_units", &self.memory_units)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::RequestBudgets;

    #[tokio::test]
    async fn test_release_returns_permits_once() {
        let metrics = Arc::new(IngressMetrics::new());
        let budgets = RequestBudgets::new(1000, 2);

        let memory = budgets.acquire_memory(400).await.unwrap();
        let slot = budgets.acquire_slot().await.unwrap();
        let tracker = RequestTracker::new(Arc::clone(&metrics), "Produce");
        let resources = SessionResources::new(Duration::from_millis(5), memory, slot, tracker);

        assert_eq!(resources.memory_units(), 400);
        assert_eq!(budgets.available_memory(), 600);
        assert_eq!(budgets.available_slots(), 1);
        assert_eq!(metrics.in_flight_requests.get(), 1);

        resources.release();
        assert_eq!(budgets.available_memory(), 1000);
        assert_eq!(budgets.available_slots(), 2);
        assert_eq!(metrics.in_flight_requests.get(), 0);
        assert_eq!(
            metrics
                .requests_completed
                .with_label_values(&["Produce"])
                .get(),
            1
        );
    }
}

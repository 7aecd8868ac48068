//! Memory and request-slot budgets shared by all connections of a server.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::AdmissionError;

/// Estimates at or above this are refused outright. It is the largest size
/// the 32-bit wire length prefix can describe.
pub const MAX_REQUEST_ESTIMATE: usize = i32::MAX as usize;

/// Generic memory estimate for a request of `request_size` bytes: room for
/// the raw bytes, the decoded form, and fixed per-request overhead.
#[must_use]
pub fn default_memory_estimate(request_size: usize) -> usize {
    request_size.saturating_mul(2).saturating_add(8000)
}

/// Counting semaphores bounding request memory and concurrency.
#[derive(Clone)]
pub struct RequestBudgets {
    memory: Arc<Semaphore>,
    memory_capacity: usize,
    slots: Arc<Semaphore>,
    slot_capacity: usize,
}

impl RequestBudgets {
    #[must_use]
    pub fn new(memory_bytes: usize, max_concurrent_requests: usize) -> Self {
        let memory_capacity = memory_bytes.min(Semaphore::MAX_PERMITS);
        let slot_capacity = max_concurrent_requests.min(Semaphore::MAX_PERMITS);
        Self {
            memory: Arc::new(Semaphore::new(memory_capacity)),
            memory_capacity,
            slots: Arc::new(Semaphore::new(slot_capacity)),
            slot_capacity,
        }
    }

    /// Reject estimates at or above [`MAX_REQUEST_ESTIMATE`].
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::EstimateTooLarge`] for oversized estimates.
    pub fn check_estimate(&self, estimate: usize) -> Result<(), AdmissionError> {
        if estimate >= MAX_REQUEST_ESTIMATE {
            return Err(AdmissionError::EstimateTooLarge {
                estimate,
                ceiling: MAX_REQUEST_ESTIMATE,
            });
        }
        Ok(())
    }

    /// Units actually reserved for `estimate`. Clamped to the budget so a
    /// single large request cannot wait for more memory than exists.
    #[must_use]
    pub fn memory_units(&self, estimate: usize) -> u32 {
        let units = estimate.clamp(1, self.memory_capacity.max(1));
        u32::try_from(units).unwrap_or(u32::MAX)
    }

    /// Reserve memory without waiting. `Ok(None)` means the caller has to
    /// wait with [`acquire_memory`](Self::acquire_memory).
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::BudgetClosed`] after [`close`](Self::close).
    pub fn try_acquire_memory(
        &self,
        units: u32,
    ) -> Result<Option<OwnedSemaphorePermit>, AdmissionError> {
        match Arc::clone(&self.memory).try_acquire_many_owned(units) {
            Ok(permit) => Ok(Some(permit)),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(AdmissionError::BudgetClosed),
        }
    }

    /// Reserve memory, suspending until enough is free.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::BudgetClosed`] after [`close`](Self::close).
    pub async fn acquire_memory(&self, units: u32) -> Result<OwnedSemaphorePermit, AdmissionError> {
        Arc::clone(&self.memory)
            .acquire_many_owned(units)
            .await
            .map_err(|_| AdmissionError::BudgetClosed)
    }

    /// Reserve one concurrent-request slot, suspending until one is free.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::BudgetClosed`] after [`close`](Self::close).
    pub async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, AdmissionError> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::BudgetClosed)
    }

    /// Wake every waiter with [`AdmissionError::BudgetClosed`].
    pub fn close(&self) {
        self.memory.close();
        self.slots.close();
    }

    #[must_use]
    pub fn available_memory(&self) -> usize {
        self.memory.available_permits()
    }

    #[must_use]
    pub fn memory_capacity(&self) -> usize {
        self.memory_capacity
    }

    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    #[must_use]
    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_estimate() {
        assert_eq!(default_memory_estimate(0), 8000);
        assert_eq!(default_memory_estimate(1000), 10_000);
        assert_eq!(default_memory_estimate(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_ceiling() {
        let budgets = RequestBudgets::new(1024, 4);
        assert!(budgets.check_estimate(MAX_REQUEST_ESTIMATE - 1).is_ok());
        assert_eq!(
            budgets.check_estimate(MAX_REQUEST_ESTIMATE),
            Err(AdmissionError::EstimateTooLarge {
                estimate: MAX_REQUEST_ESTIMATE,
                ceiling: MAX_REQUEST_ESTIMATE,
            })
        );
    }

    #[test]
    fn test_units_clamped_to_capacity() {
        let budgets = RequestBudgets::new(1024, 4);
        assert_eq!(budgets.memory_units(10), 10);
        assert_eq!(budgets.memory_units(1_000_000), 1024);
        assert_eq!(budgets.memory_units(0), 1);
    }

    #[tokio::test]
    async fn test_memory_backpressure() {
        let budgets = RequestBudgets::new(100, 4);

        let held = budgets.try_acquire_memory(80).unwrap().unwrap();
        assert!(budgets.try_acquire_memory(30).unwrap().is_none());

        let waiter = {
            let budgets = budgets.clone();
            tokio::spawn(async move { budgets.acquire_memory(30).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(permit.num_permits(), 30);
        assert_eq!(budgets.available_memory(), 70);
    }

    #[tokio::test]
    async fn test_slots_and_close() {
        let budgets = RequestBudgets::new(100, 1);
        let _slot = budgets.acquire_slot().await.unwrap();
        assert_eq!(budgets.available_slots(), 0);

        let waiter = {
            let budgets = budgets.clone();
            tokio::spawn(async move { budgets.acquire_slot().await })
        };
        tokio::task::yield_now().await;
        budgets.close();

        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            AdmissionError::BudgetClosed
        );
    }
}

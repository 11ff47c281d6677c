use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ExecError;

/// Bounds how many executions run at once.
///
/// Backed by a [`Semaphore`], so the number of outstanding [`Slot`]s can never
/// exceed the capacity, not even transiently.
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    waiting: AtomicUsize,
}

/// The right to run one execution. Released when consumed by
/// [`Slot::release`] or dropped, whichever happens first.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub fn release(self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub capacity: usize,
    pub in_use: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Keeps `waiting` accurate even when the acquiring future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Wait up to `timeout` for a free slot. A zero timeout never waits.
    pub async fn acquire(&self, timeout: Duration) -> Result<Slot, ExecError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(Slot { _permit: permit });
        }
        if timeout.is_zero() {
            return Err(ExecError::Overloaded);
        }

        let _waiting = WaitingGuard::enter(&self.waiting);
        match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Slot { _permit: permit }),
            // Closed: the orchestrator is shutting down
            Ok(Err(_)) => Err(ExecError::Overloaded),
            Err(_) => {
                tracing::debug!(timeout = ?timeout, "No execution slot freed up in time");
                Err(ExecError::Overloaded)
            }
        }
    }

    /// Stop handing out slots. Executions already admitted keep theirs.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Callers currently queued for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> AdmissionStats {
        let available = self.available();
        AdmissionStats {
            capacity: self.capacity,
            in_use: self.capacity.saturating_sub(available),
            available,
            waiting: self.waiting(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_up_to_capacity() {
        let admission = AdmissionController::new(2);
        let a = admission.acquire(Duration::ZERO).await.unwrap();
        let _b = admission.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(admission.in_use(), 2);
        assert_eq!(admission.available(), 0);

        assert_eq!(
            admission.acquire(Duration::ZERO).await.unwrap_err(),
            ExecError::Overloaded
        );

        a.release();
        assert_eq!(admission.in_use(), 1);
        assert!(admission.acquire(Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_slot_is_released() {
        let admission = AdmissionController::new(1);
        {
            let _slot = admission.acquire(Duration::ZERO).await.unwrap();
            assert_eq!(admission.in_use(), 1);
        }
        assert_eq!(admission.in_use(), 0);
    }

    #[tokio::test]
    async fn acquire_times_out_as_overloaded() {
        let admission = AdmissionController::new(1);
        let _held = admission.acquire(Duration::ZERO).await.unwrap();

        let start = std::time::Instant::now();
        let result = admission.acquire(Duration::from_millis(50)).await;
        assert_eq!(result.unwrap_err(), ExecError::Overloaded);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(admission.waiting(), 0);
    }

    #[tokio::test]
    async fn waiter_gets_slot_when_released() {
        let admission = Arc::new(AdmissionController::new(1));
        let held = admission.acquire(Duration::ZERO).await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire(Duration::from_secs(5)).await })
        };

        // Give the waiter time to queue
        while admission.waiting() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(admission.stats().waiting, 1);

        held.release();
        let slot = waiter.await.unwrap();
        assert!(slot.is_ok());
        assert_eq!(admission.in_use(), 1);
        assert_eq!(admission.waiting(), 0);
    }

    #[tokio::test]
    async fn closed_controller_rejects() {
        let admission = AdmissionController::new(1);
        admission.close();
        assert_eq!(
            admission.acquire(Duration::from_millis(10)).await.unwrap_err(),
            ExecError::Overloaded
        );
    }

    #[test]
    fn stats_snapshot() {
        let admission = AdmissionController::new(3);
        assert_eq!(
            admission.stats(),
            AdmissionStats {
                capacity: 3,
                in_use: 0,
                available: 3,
                waiting: 0,
            }
        );
    }
}

//! Bounded fair admission queue.
//!
//! A fair semaphore bounds how many executions are in flight at once;
//! submission past the bound blocks the caller until capacity frees up,
//! and dispatch preserves enqueue order. Shutdown first flips the gate so
//! new submissions are refused, then waits for every in-flight permit to
//! return.

use polyrun_core::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One admitted execution slot; capacity returns on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bounded FIFO admission queue.
///
/// # Thread Safety
///
/// `Send + Sync`; built on a fair tokio semaphore, so waiters are served
/// in arrival order.
#[derive(Debug)]
pub struct AdmissionQueue {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    closed: AtomicBool,
    pending: AtomicUsize,
}

impl AdmissionQueue {
    /// Creates a queue admitting at most `capacity` concurrent executions.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
        }
    }

    /// Waits for an execution slot, FIFO.
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let acquired = Arc::clone(&self.semaphore).acquire_owned().await;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        match acquired {
            Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Refuses new submissions and waits for in-flight work to finish.
    ///
    /// Waiters already queued ahead of the drain are still served; the
    /// fair semaphore hands them their slots before the drain completes.
    pub async fn drain(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut held = Vec::with_capacity(self.capacity);
        for _ in 0..self.capacity {
            match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => held.push(permit),
                Err(_) => break,
            }
        }
        self.semaphore.close();
        drop(held);
    }

    /// Queue bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Executions currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Submissions currently waiting for a slot.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether the queue refuses new submissions.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounds_concurrency() {
        let queue = Arc::new(AdmissionQueue::new(2));

        let a = queue.acquire().await.unwrap();
        let _b = queue.acquire().await.unwrap();
        assert_eq!(queue.in_flight(), 2);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending(), 1);

        drop(a);
        let admitted = waiter.await.unwrap();
        assert!(admitted.is_ok());
        assert_eq!(queue.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let queue = Arc::new(AdmissionQueue::new(1));
        let permit = queue.acquire().await.unwrap();

        let drainer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drainer.is_finished());

        drop(permit);
        drainer.await.unwrap();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queue = AdmissionQueue::new(1);
        queue.drain().await;
        let err = queue.acquire().await.unwrap_err();
        assert_eq!(err.kind(), polyrun_core::ErrorKind::Shutdown);
    }

    #[test]
    #[should_panic(expected = "queue capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = AdmissionQueue::new(0);
    }
}

//! Bounded FIFO ring buffer with snapshot reads.
//!
//! Backs the execution history and the audit log: appends evict the oldest
//! entry once capacity is reached, readers take non-blocking snapshots.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Append-only bounded ring with FIFO eviction.
///
/// # Thread Safety
///
/// `Send + Sync`; a `Mutex` guards the underlying deque. Writers append,
/// readers clone a snapshot, neither blocks the other for long.
#[derive(Debug)]
pub struct RingBuffer<T> {
    entries: Mutex<VecDeque<T>>,
    capacity: usize,
    /// Total number of appends, including evicted entries.
    total_appended: Mutex<u64>,
}

impl<T: Clone> RingBuffer<T> {
    /// Creates a ring holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            total_appended: Mutex::new(0),
        }
    }

    /// Appends an entry, evicting the oldest when the ring is full.
    pub fn push(&self, entry: T) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        let mut total = self.total_appended.lock().unwrap_or_else(|e| e.into_inner());
        *total += 1;
    }

    /// Returns a snapshot of current entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    /// Returns the current number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns `true` if the ring holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the ring capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the total number of appends over the ring's lifetime,
    /// including entries since evicted.
    #[must_use]
    pub fn total_appended(&self) -> u64 {
        *self.total_appended.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_snapshot() {
        let ring = RingBuffer::new(3);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.snapshot(), vec![1, 2]);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_fifo_eviction() {
        let ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.snapshot(), vec![2, 3, 4]);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.total_appended(), 5);
    }

    #[test]
    #[should_panic(expected = "ring capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = RingBuffer::<u8>::new(0);
    }

    #[test]
    fn test_concurrent_appends() {
        use std::sync::Arc;

        let ring = Arc::new(RingBuffer::new(100));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        ring.push(i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ring.len(), 100);
        assert_eq!(ring.total_appended(), 200);
    }
}

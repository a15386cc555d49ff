//! Timestamp-ordered handoff queues.
//!
//! `TimedQueue` is the only channel between pipeline stages: capture pushes
//! frames, workers pop them, workers push results, the dispatcher pops them.
//!
//! - Unbounded; backpressure is not this layer's job.
//! - Pop returns the smallest item currently present. Ordering is therefore
//!   local: an item that already left the queue is never reconsidered.
//! - Pops block with a timeout so idle threads observe shutdown promptly.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct TimedQueue<T> {
    heap: Mutex<BinaryHeap<Reverse<T>>>,
    available: Condvar,
}

impl<T: Ord> TimedQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, BinaryHeap<Reverse<T>>> {
        // A poisoned lock means a pipeline thread panicked; the process is
        // about to fail fast, so hand back the data as-is.
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        self.locked().push(Reverse(item));
        self.available.notify_one();
    }

    /// Pop the oldest item present, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut heap = self.locked();
        loop {
            if let Some(Reverse(item)) = heap.pop() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, wait) = self
                .available
                .wait_timeout(heap, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            heap = guard;
            if wait.timed_out() {
                return heap.pop().map(|Reverse(item)| item);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }
}

impl<T: Ord> Default for TimedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pops_smallest_present_item_first() {
        let q = TimedQueue::new();
        q.push(3i64);
        q.push(1);
        q.push(2);
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(1));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(2));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(3));
    }

    #[test]
    fn ordering_is_local_not_global() {
        let q = TimedQueue::new();
        q.push(5i64);
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(5));
        // An older item arriving late still pops before newer ones, but the
        // already-departed 5 is not reconsidered.
        q.push(7);
        q.push(3);
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(3));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(7));
    }

    #[test]
    fn pop_times_out_when_empty() {
        let q: TimedQueue<i64> = TimedQueue::new();
        let started = Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(50)), None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn pop_wakes_for_concurrent_push() {
        let q = Arc::new(TimedQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                q.push(42i64);
            })
        };
        assert_eq!(q.pop_timeout(Duration::from_secs(5)), Some(42));
        producer.join().unwrap();
    }

    #[test]
    fn len_tracks_contents() {
        let q = TimedQueue::new();
        assert!(q.is_empty());
        q.push(1i64);
        q.push(2);
        assert_eq!(q.len(), 2);
    }
}

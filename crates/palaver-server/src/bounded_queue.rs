//! Bounded queue with backpressure for the node's event serializer.
//!
//! Uses `crossbeam-queue::ArrayQueue` for a lock-free, bounded queue.
//! When the queue is full, `try_push` returns the item back to the caller
//! to signal backpressure: the server answers the client with `Busy`
//! instead of accumulating unbounded memory.
//!
//! # Sizing
//!
//! Size the queue using Little's Law: `capacity = throughput * latency`.
//! The default of 1024 covers 100k ops/sec at ~10ms commit latency.

use crossbeam_queue::ArrayQueue;

/// Result of attempting to push to a bounded queue.
#[derive(Debug)]
pub enum PushResult<T> {
    /// Item was successfully enqueued.
    Ok,
    /// Queue is full. Returns the item for the caller to handle.
    Backpressure(T),
}

/// A bounded, lock-free queue with backpressure signaling.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: ArrayQueue<T>,
}

impl<T> BoundedQueue<T> {
    /// Creates a new bounded queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Attempts to push an item onto the queue.
    pub fn try_push(&self, item: T) -> PushResult<T> {
        match self.inner.push(item) {
            Ok(()) => PushResult::Ok,
            Err(item) => PushResult::Backpressure(item),
        }
    }

    /// Attempts to pop an item from the queue.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Returns the number of items currently in the queue.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_in_order() {
        let queue = BoundedQueue::new(4);
        assert!(matches!(queue.try_push(1), PushResult::Ok));
        assert!(matches!(queue.try_push(2), PushResult::Ok));
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn full_queue_returns_item() {
        let queue = BoundedQueue::new(1);
        assert!(matches!(queue.try_push(1), PushResult::Ok));
        match queue.try_push(2) {
            PushResult::Backpressure(item) => assert_eq!(item, 2),
            PushResult::Ok => panic!("queue should be full"),
        }
    }
}

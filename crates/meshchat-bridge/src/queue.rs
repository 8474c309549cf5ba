//! Bounded drop-oldest queue feeding the outbound worker
//!
//! Producers never block: when the queue is full the oldest pending item
//! is evicted to make room, so the peripheral always sees the freshest
//! traffic. The single consumer waits with a bounded poll interval.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

/// Bounded FIFO with drop-oldest overflow
#[derive(Debug)]
pub struct OutboundQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    ready: Notify,
}

impl<T> OutboundQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
        }
    }

    /// Maximum number of pending items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Enqueue an item, returning the evicted oldest item on overflow
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.ready.notify_one();
        evicted
    }

    /// Dequeue without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Dequeue, waiting at most `poll` for an item to arrive
    pub async fn pop_timeout(&self, poll: Duration) -> Option<T> {
        if let Some(item) = self.try_pop() {
            return Some(item);
        }
        let _ = tokio::time::timeout(poll, self.ready.notified()).await;
        self.try_pop()
    }

    /// Wake a consumer blocked in [`pop_timeout`](Self::pop_timeout)
    pub fn wake(&self) {
        self.ready.notify_waiters();
    }

    /// Remove and return everything pending
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = OutboundQueue::new(100);
        let mut evicted = Vec::new();
        for i in 0..101 {
            if let Some(old) = queue.push(i) {
                evicted.push(old);
            }
        }

        assert_eq!(evicted, vec![0]);
        let delivered = queue.drain();
        assert_eq!(delivered, (1..101).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let queue = OutboundQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push("a");
        assert_eq!(queue.push("b"), Some("a"));
        assert_eq!(queue.try_pop(), Some("b"));
    }

    #[tokio::test]
    async fn test_pop_timeout_empty() {
        let queue: OutboundQueue<u8> = OutboundQueue::new(2);
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)).await, None);
    }

    #[tokio::test]
    async fn test_pop_timeout_wakes_on_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new(2));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            producer.push(7u8);
        });

        assert_eq!(queue.pop_timeout(Duration::from_secs(2)).await, Some(7));
    }
}

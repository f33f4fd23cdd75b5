// src/recording/event_queue.rs
//! Lock-free bounded event queue
//!
//! Holds records between `record_event` and the spool. When full, the
//! oldest record is evicted to make room and the drop is counted, so an
//! event is never lost without showing up in [`QueueStats::drop_count`].

use crate::recording::event::EventRecord;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default queue capacity (events)
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Bounded MPMC event queue with drop-oldest overflow
pub struct EventQueue {
    queue: ArrayQueue<EventRecord>,
    push_count: AtomicU64,
    pop_count: AtomicU64,
    drop_count: AtomicU64,
}

impl EventQueue {
    /// Create a new event queue. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Append a record (non-blocking)
    ///
    /// Returns the evicted record when the queue was full.
    pub fn enqueue(&self, record: EventRecord) -> Option<EventRecord> {
        self.push_count.fetch_add(1, Ordering::Relaxed);
        let evicted = self.queue.force_push(record);
        if evicted.is_some() {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Remove up to `max_batch` of the oldest records, FIFO
    pub fn drain(&self, max_batch: usize) -> Vec<EventRecord> {
        let mut batch = Vec::with_capacity(max_batch.min(self.queue.len()));
        while batch.len() < max_batch {
            match self.queue.pop() {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        self.pop_count.fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Total records enqueued
    pub push_count: u64,

    /// Total records drained
    pub pop_count: u64,

    /// Total records evicted by overflow
    pub drop_count: u64,

    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::event::EventOptions;
    use crate::utils::clock::Timestamp;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn create_test_event(key: &str) -> EventRecord {
        EventRecord::new(
            key,
            EventOptions::new(),
            Timestamp {
                wall_ms: 0,
                monotonic_ns: 0,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_queue_creation() {
        let queue = EventQueue::new(100);
        assert_eq!(queue.capacity(), 100);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_is_fifo_and_bounded() {
        let queue = EventQueue::new(10);
        for i in 0..5 {
            assert!(queue.enqueue(create_test_event(&format!("evt_{}", i))).is_none());
        }

        let first = queue.drain(3);
        let keys: Vec<_> = first.iter().map(|r| r.key().to_string()).collect();
        assert_eq!(keys, vec!["evt_0", "evt_1", "evt_2"]);
        assert_eq!(queue.len(), 2);

        let rest = queue.drain(10);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].key(), "evt_3");
        assert!(queue.drain(10).is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let queue = EventQueue::new(2);

        queue.enqueue(create_test_event("evt_1"));
        queue.enqueue(create_test_event("evt_2"));
        let evicted = queue.enqueue(create_test_event("evt_3"));

        assert_eq!(evicted.unwrap().key(), "evt_1");
        let stats = queue.stats();
        assert_eq!(stats.drop_count, 1);
        assert_eq!(stats.push_count, 3);

        let remaining: Vec<_> = queue.drain(10).into_iter().map(|r| r.key().to_string()).collect();
        assert_eq!(remaining, vec!["evt_2", "evt_3"]);
    }

    #[test]
    fn test_stats() {
        let queue = EventQueue::new(10);

        queue.enqueue(create_test_event("evt_1"));
        queue.enqueue(create_test_event("evt_2"));
        queue.drain(1);

        let stats = queue.stats();
        assert_eq!(stats.push_count, 2);
        assert_eq!(stats.pop_count, 1);
        assert_eq!(stats.current_size, 1);
        assert!((stats.fill_percentage() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_enqueue_and_drain() {
        use std::collections::HashSet;
        use std::thread;

        let queue = Arc::new(EventQueue::new(10_000));
        let mut handles = vec![];

        for i in 0..8 {
            let q = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for j in 0..500 {
                    q.enqueue(create_test_event(&format!("evt_{}_{}", i, j)));
                }
            }));
        }

        let drainer = {
            let q = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..200 {
                    seen.extend(q.drain(16));
                    thread::yield_now();
                }
                seen
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        let mut seen = drainer.join().unwrap();
        seen.extend(queue.drain(usize::MAX));

        let unique: HashSet<_> = seen.iter().map(|r| r.key().to_string()).collect();
        assert_eq!(seen.len(), 4_000);
        assert_eq!(unique.len(), 4_000);
        assert_eq!(queue.stats().drop_count, 0);
    }

    proptest! {
        #[test]
        fn prop_overflow_keeps_newest(capacity in 1usize..32, total in 0usize..96) {
            let queue = EventQueue::new(capacity);
            for i in 0..total {
                queue.enqueue(create_test_event(&format!("evt_{}", i)));
            }

            let expected_dropped = total.saturating_sub(capacity);
            prop_assert_eq!(queue.stats().drop_count, expected_dropped as u64);

            let drained: Vec<_> = queue.drain(usize::MAX).into_iter().map(|r| r.key().to_string()).collect();
            let expected: Vec<_> = (expected_dropped..total).map(|i| format!("evt_{}", i)).collect();
            prop_assert_eq!(drained, expected);
        }
    }
}

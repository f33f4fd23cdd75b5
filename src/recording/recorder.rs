// src/recording/recorder.rs
//! Event recorder: queue in front, spool behind
//!
//! `record` is the hot path. It pushes into the lock-free queue, then moves
//! whatever the queue holds into the spool in batches of at most
//! `max_batch_events`. The spool append is synchronous, so a record that
//! made it past `record` is durable (unless the spool is degraded).
//!
//! A spool operation that fails with a storage error switches the spool to
//! memory and retries there. The process keeps recording, only durability
//! is lost.
//!
//! When the client restarts, the old recorder is retired and forwards every
//! later `record` to its successor.

use crate::observability::Diagnostics;
use crate::recording::event::EventRecord;
use crate::recording::event_queue::{EventQueue, QueueStats};
use crate::recording::spool::DurableSpool;
use crate::utils::errors::{AnalyticsError, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Moves recorded events from the queue into the spool
pub struct EventRecorder {
    queue: Arc<EventQueue>,
    spool: Arc<DurableSpool>,
    diagnostics: Arc<Diagnostics>,
    max_batch_events: usize,
    persist_lock: Mutex<()>,
    successor: RwLock<Option<Arc<EventRecorder>>>,
}

impl EventRecorder {
    pub fn new(
        queue: Arc<EventQueue>,
        spool: Arc<DurableSpool>,
        diagnostics: Arc<Diagnostics>,
        max_batch_events: usize,
    ) -> Self {
        Self {
            queue,
            spool,
            diagnostics,
            max_batch_events: max_batch_events.max(1),
            persist_lock: Mutex::new(()),
            successor: RwLock::new(None),
        }
    }

    /// Record an event and persist it
    pub fn record(&self, record: EventRecord) {
        let successor = self.successor.read().clone();
        if let Some(successor) = successor {
            debug!("Recorder retired, forwarding '{}'", record.key());
            return successor.record(record);
        }

        if let Some(evicted) = self.queue.enqueue(record) {
            warn!("Event queue full, evicted oldest event '{}'", evicted.key());
            self.diagnostics.events_dropped(1, "queue_overflow");
        }
        self.diagnostics.event_recorded();
        self.persist();
    }

    /// Drain the queue into the spool; returns the number of events persisted
    ///
    /// Serialized so that spool sequence order matches queue order.
    pub fn persist(&self) -> usize {
        let _guard = self.persist_lock.lock();
        let mut persisted = 0;

        loop {
            let batch = self.queue.drain(self.max_batch_events);
            if batch.is_empty() {
                break;
            }

            if self.append(&batch) {
                persisted += batch.len();
            }
        }

        if persisted > 0 {
            debug!("Persisted {} events to spool", persisted);
        }
        persisted
    }

    fn append(&self, batch: &[EventRecord]) -> bool {
        match self.with_spool(|spool| spool.append(batch)) {
            Ok(outcome) => {
                self.diagnostics.events_dropped(outcome.evicted_events, "spool_eviction");
                true
            }
            Err(e) => self.discard(batch, &e),
        }
    }

    /// Run a spool operation, degrading to memory and retrying once on a
    /// storage error
    pub fn with_spool<T>(&self, op: impl Fn(&DurableSpool) -> Result<T>) -> Result<T> {
        match op(&self.spool) {
            Err(e @ AnalyticsError::Storage(_)) => {
                error!("Spool operation failed, falling back to memory: {}", e);
                self.diagnostics.storage_error(&e);
                self.spool.fall_back_to_memory();
                self.diagnostics.mark_degraded();
                op(&self.spool)
            }
            other => other,
        }
    }

    fn discard(&self, batch: &[EventRecord], error: &AnalyticsError) -> bool {
        error!("Dropping batch of {} events: {}", batch.len(), error);
        self.diagnostics.storage_error(error);
        self.diagnostics.events_dropped(batch.len() as u64, "spool_write_failed");
        false
    }

    /// Forward all later records to `successor`
    ///
    /// Whatever this recorder's queue still holds is handed over too.
    pub fn retire(&self, successor: Arc<EventRecorder>) {
        let _guard = self.persist_lock.lock();
        *self.successor.write() = Some(Arc::clone(&successor));

        if !Arc::ptr_eq(&self.queue, &successor.queue) {
            loop {
                let batch = self.queue.drain(self.max_batch_events);
                if batch.is_empty() {
                    break;
                }
                for record in batch {
                    if let Some(evicted) = successor.queue.enqueue(record) {
                        warn!("Event queue full, evicted oldest event '{}'", evicted.key());
                        self.diagnostics.events_dropped(1, "queue_overflow");
                    }
                }
            }
        }
        successor.persist();
    }

    pub fn is_retired(&self) -> bool {
        self.successor.read().is_some()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn spool(&self) -> &Arc<DurableSpool> {
        &self.spool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::event::EventOptions;
    use crate::recording::spool::SPOOL_DB_NAME;
    use crate::utils::clock::Timestamp;
    use tempfile::tempdir;

    fn event(key: &str) -> EventRecord {
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

    fn recorder(spool: DurableSpool, max_batch: usize) -> (EventRecorder, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::new());
        let recorder = EventRecorder::new(
            Arc::new(EventQueue::new(100)),
            Arc::new(spool),
            Arc::clone(&diagnostics),
            max_batch,
        );
        (recorder, diagnostics)
    }

    #[test]
    fn test_record_is_spooled_immediately() {
        let dir = tempdir().unwrap();
        let (recorder, diagnostics) = recorder(DurableSpool::open(dir.path(), 100).unwrap(), 10);

        recorder.record(event("launch"));

        assert_eq!(recorder.queue_stats().current_size, 0);
        let pending = recorder.spool().recover_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].events[0].key(), "launch");
        assert_eq!(diagnostics.snapshot().events_recorded, 1);
    }

    #[test]
    fn test_persist_splits_into_batches() {
        let queue = Arc::new(EventQueue::new(100));
        let spool = Arc::new(DurableSpool::memory(100));
        let recorder = EventRecorder::new(
            Arc::clone(&queue),
            Arc::clone(&spool),
            Arc::new(Diagnostics::new()),
            4,
        );

        for i in 0..10 {
            queue.enqueue(event(&format!("evt_{}", i)));
        }
        assert_eq!(recorder.persist(), 10);

        let pending = spool.recover_pending().unwrap();
        let sizes: Vec<_> = pending.iter().map(|e| e.events.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(pending[0].events[0].key(), "evt_0");
    }

    #[test]
    fn test_retired_recorder_forwards_to_successor() {
        let (old, diagnostics) = recorder(DurableSpool::memory(100), 10);
        let next = Arc::new(EventRecorder::new(
            Arc::new(EventQueue::new(100)),
            Arc::new(DurableSpool::memory(100)),
            Arc::clone(&diagnostics),
            10,
        ));

        old.retire(Arc::clone(&next));
        old.record(event("after_restart"));

        assert!(old.is_retired());
        assert!(old.spool().is_empty().unwrap());
        let pending = next.spool().recover_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].events[0].key(), "after_restart");
        assert_eq!(diagnostics.snapshot().events_recorded, 1);
    }

    #[test]
    fn test_storage_failure_after_open_degrades_to_memory() {
        let dir = tempdir().unwrap();
        let (recorder, diagnostics) = recorder(DurableSpool::open(dir.path(), 100).unwrap(), 10);
        recorder.record(event("before_failure"));
        assert!(recorder.spool().is_durable());

        let conn = rusqlite::Connection::open(dir.path().join(SPOOL_DB_NAME)).unwrap();
        conn.execute_batch("DROP TABLE spool_entries").unwrap();
        drop(conn);

        recorder.record(event("after_failure"));

        let snapshot = diagnostics.snapshot();
        assert!(snapshot.degraded);
        assert!(snapshot.storage_errors >= 1);
        assert!(!recorder.spool().is_durable());
        let keys: Vec<_> = recorder
            .spool()
            .recover_pending()
            .unwrap()
            .iter()
            .flat_map(|entry| entry.events.iter().map(|e| e.key().to_string()))
            .collect();
        assert!(keys.contains(&"after_failure".to_string()));
    }

    #[test]
    fn test_spool_eviction_is_counted() {
        let (recorder, diagnostics) = recorder(DurableSpool::memory(2), 10);
        for i in 0..4 {
            recorder.record(event(&format!("evt_{}", i)));
        }

        assert_eq!(diagnostics.snapshot().events_dropped, 2);
        assert_eq!(recorder.spool().len().unwrap(), 2);
    }
}

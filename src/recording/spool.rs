// src/recording/spool.rs
//! Durable event spool using SQLite
//!
//! Each appended batch becomes one row keyed by a strictly increasing
//! sequence number, with the events stored as a zstd-compressed JSON blob.
//! The database runs in WAL mode with `synchronous=FULL`, so an append that
//! returns `Ok` has been fsynced.
//!
//! Acknowledged entries are deleted. Entries left `in_flight` by a crash
//! are reset to `pending` when the spool is opened.
//!
//! If SQLite stops cooperating the spool can be switched to an in-memory
//! backend ([`DurableSpool::fall_back_to_memory`]). Delivery keeps working,
//! durability is gone until the next process start.

use crate::recording::compressor::Compressor;
use crate::recording::event::EventRecord;
use crate::utils::errors::{AnalyticsError, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Database file created inside the storage directory
pub const SPOOL_DB_NAME: &str = "spool.db";

const INSTALLATION_ID_KEY: &str = "installation_id";

/// Delivery state of a spooled entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting to be sent
    Pending,

    /// Handed to the sender, outcome unknown
    InFlight,
}

impl EntryState {
    fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::InFlight => "in_flight",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "in_flight" => EntryState::InFlight,
            _ => EntryState::Pending,
        }
    }
}

/// One spooled batch
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolEntry {
    pub sequence: u64,
    pub events: Vec<EventRecord>,
    pub state: EntryState,

    /// Failed delivery attempts so far
    pub attempts: u32,

    pub created_at_ms: i64,
}

/// Result of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub sequence: u64,

    /// Events evicted to stay within the entry limit
    pub evicted_events: u64,
}

struct MemoryEntry {
    events: Vec<EventRecord>,
    state: EntryState,
    attempts: u32,
    created_at_ms: i64,
}

struct MemoryBackend {
    entries: BTreeMap<u64, MemoryEntry>,
    installation_id: String,
}

enum Backend {
    Sqlite(Connection),
    Memory(MemoryBackend),
}

struct SpoolInner {
    backend: Backend,
    last_sequence: u64,
}

/// Persistent, sequence-ordered store of unacknowledged batches
pub struct DurableSpool {
    inner: Mutex<SpoolInner>,
    compressor: Compressor,
    max_entries: usize,
    degraded: AtomicBool,
}

impl DurableSpool {
    /// Open (or create) the spool database inside `dir`
    pub fn open(dir: &Path, max_entries: usize) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            AnalyticsError::Storage(format!("Failed to create spool directory {:?}: {}", dir, e))
        })?;

        let db_path = dir.join(SPOOL_DB_NAME);
        let conn = Connection::open(&db_path)
            .map_err(|e| AnalyticsError::Storage(format!("Failed to open spool database: {}", e)))?;

        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=FULL;")?;

        Self::init_schema(&conn)?;

        let recovered = conn.execute(
            "UPDATE spool_entries SET state = ?1 WHERE state = ?2",
            params![EntryState::Pending.as_str(), EntryState::InFlight.as_str()],
        )?;
        if recovered > 0 {
            warn!("Reset {} in-flight spool entries to pending after restart", recovered);
        }

        let last_sequence: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM sqlite_sequence WHERE name = 'spool_entries'",
            [],
            |row| row.get(0),
        )?;

        info!(
            "Event spool opened at {:?} (journal_mode={}, last_sequence={})",
            db_path, journal_mode, last_sequence
        );

        Ok(Self {
            inner: Mutex::new(SpoolInner {
                backend: Backend::Sqlite(conn),
                last_sequence: last_sequence as u64,
            }),
            compressor: Compressor::default(),
            max_entries: max_entries.max(1),
            degraded: AtomicBool::new(false),
        })
    }

    /// Spool that lives only in memory
    pub fn memory(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(SpoolInner {
                backend: Backend::Memory(MemoryBackend {
                    entries: BTreeMap::new(),
                    installation_id: Ulid::new().to_string(),
                }),
                last_sequence: 0,
            }),
            compressor: Compressor::default(),
            max_entries: max_entries.max(1),
            degraded: AtomicBool::new(false),
        }
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS spool_entries (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                payload BLOB NOT NULL,
                event_count INTEGER NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_spool_state ON spool_entries(state, sequence);
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Durably persist a batch under a new sequence number
    pub fn append(&self, events: &[EventRecord]) -> Result<AppendOutcome> {
        if events.is_empty() {
            return Err(AnalyticsError::InvalidEvent("cannot spool an empty batch".into()));
        }

        let created_at_ms = chrono::Utc::now().timestamp_millis();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let max_entries = self.max_entries;

        let (sequence, evicted_events) = match &mut inner.backend {
            Backend::Sqlite(conn) => {
                let payload = self.compressor.encode_batch(events)?;
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO spool_entries (payload, event_count, state, attempts, created_at)
                     VALUES (?1, ?2, ?3, 0, ?4)",
                    params![
                        payload,
                        events.len() as i64,
                        EntryState::Pending.as_str(),
                        created_at_ms
                    ],
                )?;
                let sequence = tx.last_insert_rowid() as u64;
                let evicted = Self::evict_sqlite(&tx, max_entries, sequence)?;
                tx.commit()?;
                (sequence, evicted)
            }
            Backend::Memory(memory) => {
                let sequence = inner.last_sequence + 1;
                memory.entries.insert(
                    sequence,
                    MemoryEntry {
                        events: events.to_vec(),
                        state: EntryState::Pending,
                        attempts: 0,
                        created_at_ms,
                    },
                );
                let evicted = Self::evict_memory(memory, max_entries, sequence);
                (sequence, evicted)
            }
        };

        inner.last_sequence = inner.last_sequence.max(sequence);
        debug!("Spooled batch {} ({} events)", sequence, events.len());

        Ok(AppendOutcome {
            sequence,
            evicted_events,
        })
    }

    /// Evict the oldest pending entries other than `keep` beyond `max_entries`
    fn evict_sqlite(conn: &Connection, max_entries: usize, keep: u64) -> Result<u64> {
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM spool_entries", [], |row| row.get(0))?;
        let excess = total - max_entries as i64;
        if excess <= 0 {
            return Ok(0);
        }

        let victims = {
            let mut stmt = conn.prepare(
                "SELECT sequence, event_count FROM spool_entries
                 WHERE state = ?1 AND sequence <> ?2 ORDER BY sequence LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![EntryState::Pending.as_str(), keep as i64, excess], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut evicted_events = 0u64;
        for (sequence, event_count) in victims {
            conn.execute("DELETE FROM spool_entries WHERE sequence = ?1", params![sequence])?;
            evicted_events += event_count as u64;
        }

        if evicted_events > 0 {
            warn!("Spool full, evicted {} oldest events", evicted_events);
        }
        Ok(evicted_events)
    }

    fn evict_memory(memory: &mut MemoryBackend, max_entries: usize, keep: u64) -> u64 {
        let excess = memory.entries.len().saturating_sub(max_entries);
        let victims: Vec<u64> = memory
            .entries
            .iter()
            .filter(|(sequence, entry)| **sequence != keep && entry.state == EntryState::Pending)
            .map(|(sequence, _)| *sequence)
            .take(excess)
            .collect();

        let mut evicted_events = 0u64;
        for sequence in victims {
            if let Some(entry) = memory.entries.remove(&sequence) {
                evicted_events += entry.events.len() as u64;
            }
        }

        if evicted_events > 0 {
            warn!("Spool full, evicted {} oldest events", evicted_events);
        }
        evicted_events
    }

    /// All pending entries, in sequence order
    ///
    /// Entries whose payload can no longer be decoded are deleted and
    /// logged rather than blocking the entries behind them.
    pub fn recover_pending(&self) -> Result<Vec<SpoolEntry>> {
        let mut inner = self.inner.lock();

        match &mut inner.backend {
            Backend::Sqlite(conn) => {
                let rows = {
                    let mut stmt = conn.prepare(
                        "SELECT sequence, payload, state, attempts, created_at FROM spool_entries
                         WHERE state = ?1 ORDER BY sequence",
                    )?;
                    let rows = stmt.query_map(params![EntryState::Pending.as_str()], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })?;
                    rows.collect::<std::result::Result<Vec<_>, _>>()?
                };

                let mut entries = Vec::with_capacity(rows.len());
                for (sequence, payload, state, attempts, created_at_ms) in rows {
                    match self.compressor.decode_batch(&payload) {
                        Ok(events) => entries.push(SpoolEntry {
                            sequence: sequence as u64,
                            events,
                            state: EntryState::parse(&state),
                            attempts: attempts as u32,
                            created_at_ms,
                        }),
                        Err(e) => {
                            warn!("Discarding unreadable spool entry {}: {}", sequence, e);
                            conn.execute(
                                "DELETE FROM spool_entries WHERE sequence = ?1",
                                params![sequence],
                            )?;
                        }
                    }
                }
                Ok(entries)
            }
            Backend::Memory(memory) => Ok(memory
                .entries
                .iter()
                .filter(|(_, entry)| entry.state == EntryState::Pending)
                .map(|(sequence, entry)| SpoolEntry {
                    sequence: *sequence,
                    events: entry.events.clone(),
                    state: entry.state,
                    attempts: entry.attempts,
                    created_at_ms: entry.created_at_ms,
                })
                .collect()),
        }
    }

    /// Mark entries as handed to the sender
    pub fn mark_in_flight(&self, sequences: &[u64]) -> Result<()> {
        self.set_state(sequences, EntryState::InFlight, false)
    }

    /// Revert entries after a failed attempt
    pub fn mark_pending(&self, sequences: &[u64]) -> Result<()> {
        self.set_state(sequences, EntryState::Pending, true)
    }

    fn set_state(&self, sequences: &[u64], state: EntryState, count_attempt: bool) -> Result<()> {
        let mut inner = self.inner.lock();

        match &mut inner.backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for sequence in sequences {
                    tx.execute(
                        "UPDATE spool_entries SET state = ?1, attempts = attempts + ?2 WHERE sequence = ?3",
                        params![state.as_str(), count_attempt as i64, *sequence as i64],
                    )?;
                }
                tx.commit()?;
            }
            Backend::Memory(memory) => {
                for sequence in sequences {
                    if let Some(entry) = memory.entries.get_mut(sequence) {
                        entry.state = state;
                        if count_attempt {
                            entry.attempts += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove delivered (or permanently rejected) entries
    pub fn mark_acknowledged(&self, sequences: &[u64]) -> Result<()> {
        let mut inner = self.inner.lock();

        match &mut inner.backend {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for sequence in sequences {
                    tx.execute(
                        "DELETE FROM spool_entries WHERE sequence = ?1",
                        params![*sequence as i64],
                    )?;
                }
                tx.commit()?;
            }
            Backend::Memory(memory) => {
                for sequence in sequences {
                    memory.entries.remove(sequence);
                }
            }
        }
        Ok(())
    }

    /// Number of unacknowledged entries
    pub fn len(&self) -> Result<usize> {
        let inner = self.inner.lock();
        match &inner.backend {
            Backend::Sqlite(conn) => {
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM spool_entries", [], |row| row.get(0))?;
                Ok(total as usize)
            }
            Backend::Memory(memory) => Ok(memory.entries.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Stable installation identifier, generated on first use
    pub fn installation_id(&self) -> Result<String> {
        let mut inner = self.inner.lock();
        match &mut inner.backend {
            Backend::Sqlite(conn) => {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT value FROM metadata WHERE key = ?1",
                        params![INSTALLATION_ID_KEY],
                        |row| row.get(0),
                    )
                    .optional()?;

                match existing {
                    Some(id) => Ok(id),
                    None => {
                        let id = Ulid::new().to_string();
                        conn.execute(
                            "INSERT INTO metadata (key, value) VALUES (?1, ?2)",
                            params![INSTALLATION_ID_KEY, id],
                        )?;
                        info!("Generated installation id {}", id);
                        Ok(id)
                    }
                }
            }
            Backend::Memory(memory) => Ok(memory.installation_id.clone()),
        }
    }

    /// True once the spool has fallen back to memory
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// True when entries survive a restart
    pub fn is_durable(&self) -> bool {
        matches!(self.inner.lock().backend, Backend::Sqlite(_))
    }

    /// Switch to the memory backend, salvaging whatever SQLite still returns
    ///
    /// Returns the number of entries carried over. Sequence numbers keep
    /// increasing from the last one issued.
    pub fn fall_back_to_memory(&self) -> usize {
        let mut inner = self.inner.lock();

        let salvaged = match &inner.backend {
            Backend::Memory(_) => {
                self.degraded.store(true, Ordering::Release);
                return 0;
            }
            Backend::Sqlite(conn) => self.salvage(conn),
        };

        let (entries, installation_id) = salvaged;
        let carried = entries.len();
        if let Some(max) = entries.keys().next_back() {
            inner.last_sequence = inner.last_sequence.max(*max);
        }

        inner.backend = Backend::Memory(MemoryBackend {
            entries,
            installation_id: installation_id.unwrap_or_else(|| Ulid::new().to_string()),
        });
        self.degraded.store(true, Ordering::Release);

        warn!(
            "Event spool degraded to memory-only, {} entries carried over",
            carried
        );
        carried
    }

    fn salvage(&self, conn: &Connection) -> (BTreeMap<u64, MemoryEntry>, Option<String>) {
        let mut entries = BTreeMap::new();

        let rows = conn
            .prepare(
                "SELECT sequence, payload, state, attempts, created_at FROM spool_entries ORDER BY sequence",
            )
            .and_then(|mut stmt| {
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>();
                rows
            });

        match rows {
            Ok(rows) => {
                for (sequence, payload, state, attempts, created_at_ms) in rows {
                    if let Ok(events) = self.compressor.decode_batch(&payload) {
                        entries.insert(
                            sequence as u64,
                            MemoryEntry {
                                events,
                                state: EntryState::parse(&state),
                                attempts: attempts as u32,
                                created_at_ms,
                            },
                        );
                    }
                }
            }
            Err(e) => warn!("Could not salvage spool entries: {}", e),
        }

        let installation_id = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![INSTALLATION_ID_KEY],
                |row| row.get::<_, String>(0),
            )
            .ok();

        (entries, installation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::event::EventOptions;
    use crate::utils::clock::Timestamp;
    use tempfile::tempdir;

    fn event(key: &str) -> EventRecord {
        EventRecord::new(
            key,
            EventOptions::new().count(2).sum(9.99),
            Timestamp {
                wall_ms: 1_700_000_000_000,
                monotonic_ns: 7,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_spool_creation() {
        let dir = tempdir().unwrap();
        let spool = DurableSpool::open(dir.path(), 100).unwrap();
        assert!(spool.is_durable());
        assert!(!spool.is_degraded());
        assert!(spool.is_empty().unwrap());
        assert!(dir.path().join(SPOOL_DB_NAME).exists());
    }

    #[test]
    fn test_open_fails_with_storage_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let result = DurableSpool::open(&blocker.join("spool"), 100);
        assert!(matches!(result, Err(AnalyticsError::Storage(_))));
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let dir = tempdir().unwrap();
        let spool = DurableSpool::open(dir.path(), 100).unwrap();

        let first = spool.append(&[event("a")]).unwrap().sequence;
        let second = spool.append(&[event("b")]).unwrap().sequence;
        assert!(second > first);

        spool.mark_acknowledged(&[second]).unwrap();
        let third = spool.append(&[event("c")]).unwrap().sequence;
        assert!(third > second);
    }

    #[test]
    fn test_recover_after_reopen_returns_batch_unchanged() {
        let dir = tempdir().unwrap();
        let batch = vec![event("purchase"), event("refund")];

        let sequence = {
            let spool = DurableSpool::open(dir.path(), 100).unwrap();
            let sequence = spool.append(&batch).unwrap().sequence;
            spool.mark_in_flight(&[sequence]).unwrap();
            sequence
        };

        let spool = DurableSpool::open(dir.path(), 100).unwrap();
        let pending = spool.recover_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence, sequence);
        assert_eq!(pending[0].state, EntryState::Pending);
        assert_eq!(pending[0].events, batch);

        let next = spool.append(&[event("later")]).unwrap().sequence;
        assert!(next > sequence);
    }

    #[test]
    fn test_in_flight_entries_not_recovered_until_reverted() {
        let spool = DurableSpool::memory(100);
        let a = spool.append(&[event("a")]).unwrap().sequence;
        let b = spool.append(&[event("b")]).unwrap().sequence;

        spool.mark_in_flight(&[a]).unwrap();
        let pending: Vec<_> = spool.recover_pending().unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(pending, vec![b]);

        spool.mark_pending(&[a]).unwrap();
        let pending = spool.recover_pending().unwrap();
        assert_eq!(pending[0].sequence, a);
        assert_eq!(pending[0].attempts, 1);
    }

    #[test]
    fn test_acknowledged_entries_are_removed() {
        let dir = tempdir().unwrap();
        let spool = DurableSpool::open(dir.path(), 100).unwrap();
        let a = spool.append(&[event("a")]).unwrap().sequence;
        spool.append(&[event("b")]).unwrap();

        spool.mark_acknowledged(&[a]).unwrap();
        assert_eq!(spool.len().unwrap(), 1);
        assert_eq!(spool.recover_pending().unwrap()[0].events[0].key(), "b");
    }

    #[test]
    fn test_eviction_drops_oldest_pending() {
        let dir = tempdir().unwrap();
        let spool = DurableSpool::open(dir.path(), 2).unwrap();

        spool.append(&[event("a"), event("a")]).unwrap();
        spool.append(&[event("b")]).unwrap();
        let outcome = spool.append(&[event("c")]).unwrap();

        assert_eq!(outcome.evicted_events, 2);
        let keys: Vec<_> = spool
            .recover_pending()
            .unwrap()
            .iter()
            .map(|e| e.events[0].key().to_string())
            .collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn test_memory_eviction_skips_in_flight() {
        let spool = DurableSpool::memory(1);
        let a = spool.append(&[event("a")]).unwrap().sequence;
        spool.mark_in_flight(&[a]).unwrap();

        let outcome = spool.append(&[event("b")]).unwrap();
        assert_eq!(outcome.evicted_events, 0);
        assert_eq!(spool.len().unwrap(), 2);

        let outcome = spool.append(&[event("c")]).unwrap();
        assert_eq!(outcome.evicted_events, 1);
    }

    #[test]
    fn test_installation_id_persists() {
        let dir = tempdir().unwrap();
        let first = DurableSpool::open(dir.path(), 10).unwrap().installation_id().unwrap();
        let second = DurableSpool::open(dir.path(), 10).unwrap().installation_id().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 26);
    }

    #[test]
    fn test_fall_back_to_memory_carries_entries() {
        let dir = tempdir().unwrap();
        let spool = DurableSpool::open(dir.path(), 100).unwrap();
        let id = spool.installation_id().unwrap();
        let a = spool.append(&[event("a")]).unwrap().sequence;

        assert_eq!(spool.fall_back_to_memory(), 1);
        assert!(spool.is_degraded());
        assert!(!spool.is_durable());
        assert_eq!(spool.installation_id().unwrap(), id);

        let b = spool.append(&[event("b")]).unwrap().sequence;
        assert!(b > a);
        assert_eq!(spool.recover_pending().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let spool = DurableSpool::memory(10);
        assert!(spool.append(&[]).is_err());
    }
}

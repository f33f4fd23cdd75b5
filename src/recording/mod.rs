// src/recording/mod.rs
//! Event recording and durable spooling
//!
//! - **Event**: immutable [`EventRecord`] plus the optional-field
//!   [`EventOptions`] used by the public API
//! - **Event Queue**: lock-free bounded queue, drop-oldest on overflow
//! - **Compressor**: zstd codec for spooled batches
//! - **Spool**: SQLite-backed log keyed by sequence number
//! - **Recorder**: moves queued events into the spool
//!
//! # Architecture
//!
//! ```text
//! record_event() → EventQueue → EventRecorder::persist()
//!                                      ↓
//!                              DurableSpool::append (fsync)
//!                                      ↓
//!                               FlushEngine → Sender
//! ```

pub mod compressor;
pub mod event;
pub mod event_queue;
pub mod recorder;
pub mod spool;

pub use compressor::{Compressor, COMPRESSION_LEVEL};
pub use event::{EventOptions, EventRecord, Segmentation, SESSION_DURATION_KEY};
pub use event_queue::{EventQueue, QueueStats, DEFAULT_QUEUE_CAPACITY};
pub use recorder::EventRecorder;
pub use spool::{AppendOutcome, DurableSpool, EntryState, SpoolEntry};

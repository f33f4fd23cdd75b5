// src/delivery/mod.rs
//! Delivery: spool → collector
//!
//! - **Sender**: transport contract ([`Sender`], [`SendOutcome`])
//! - **Batch**: wire payload encoding and request-sized batch planning
//! - **Backoff**: capped exponential delay with jitter
//! - **Network**: metered/offline policy input
//! - **Flush Engine**: one delivery cycle
//! - **Worker**: background thread driving cycles and session ticks

pub mod backoff;
pub mod batch;
pub mod flush_engine;
pub mod network;
pub mod sender;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use batch::{encode_payload, plan_batches, BatchLimits, Envelope, SDK_NAME};
pub use flush_engine::{CycleOutcome, CycleReport, FlushEngine, FlushSettings, FlushTrigger, SkipReason};
pub use network::{NetworkMonitor, NetworkStatus, SharedNetworkStatus};
pub use sender::{OutboundBatch, SendOutcome, Sender};
pub use worker::{FlushHandle, FlushWorker, WorkerSchedule, WORKER_THREAD_NAME};

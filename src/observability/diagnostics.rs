// src/observability/diagnostics.rs
//! Internal diagnostic record
//!
//! The public client never returns errors. Whatever goes wrong lands here:
//! counters for the headline numbers and a bounded ring of recent records
//! for the details. Counters are mirrored into `metrics`.

use crate::utils::errors::AnalyticsError;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Recent records kept in the ring
pub const DIAGNOSTIC_HISTORY: usize = 64;

/// Severity of a diagnostic record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Warn,
    Error,
}

/// One absorbed failure or notable event
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticRecord {
    pub level: DiagnosticLevel,
    pub kind: &'static str,
    pub message: String,
    pub at_ms: i64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub events_recorded: u64,
    pub events_rejected: u64,
    pub events_dropped: u64,
    pub events_sent: u64,
    pub batches_sent: u64,
    pub batches_rejected: u64,
    pub send_failures: u64,
    pub storage_errors: u64,
    pub degraded: bool,
}

/// Shared diagnostic sink
#[derive(Default)]
pub struct Diagnostics {
    events_recorded: AtomicU64,
    events_rejected: AtomicU64,
    events_dropped: AtomicU64,
    events_sent: AtomicU64,
    batches_sent: AtomicU64,
    batches_rejected: AtomicU64,
    send_failures: AtomicU64,
    storage_errors: AtomicU64,
    degraded: AtomicBool,
    recent: Mutex<VecDeque<DiagnosticRecord>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_recorded(&self) {
        self.events_recorded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("analytics_events_recorded_total").increment(1);
    }

    pub fn event_rejected(&self, error: &AnalyticsError) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("analytics_events_rejected_total").increment(1);
        self.push(DiagnosticLevel::Warn, error.kind(), error.to_string());
    }

    /// Events lost to queue overflow, spool eviction or a failed spool write
    pub fn events_dropped(&self, count: u64, reason: &'static str) {
        if count == 0 {
            return;
        }
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("analytics_events_dropped_total", "reason" => reason).increment(count);
        self.push(DiagnosticLevel::Warn, reason, drop_message(count, reason));
    }

    pub fn batch_sent(&self, events: u64) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.events_sent.fetch_add(events, Ordering::Relaxed);
        metrics::counter!("analytics_batches_sent_total").increment(1);
        metrics::counter!("analytics_events_sent_total").increment(events);
    }

    /// Batch refused permanently and discarded
    pub fn batch_rejected(&self, events: u64, error: &AnalyticsError) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
        self.events_dropped.fetch_add(events, Ordering::Relaxed);
        metrics::counter!("analytics_batches_rejected_total").increment(1);
        metrics::counter!("analytics_events_dropped_total", "reason" => "rejected").increment(events);
        self.push(
            DiagnosticLevel::Error,
            error.kind(),
            format!("Dropped batch of {} events: {}", events, error),
        );
    }

    pub fn send_failed(&self, error: &AnalyticsError) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("analytics_send_failures_total", "kind" => error.kind()).increment(1);
        self.push(DiagnosticLevel::Warn, error.kind(), error.to_string());
    }

    pub fn storage_error(&self, error: &AnalyticsError) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("analytics_storage_errors_total").increment(1);
        self.push(DiagnosticLevel::Error, error.kind(), error.to_string());
    }

    pub fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            metrics::gauge!("analytics_spool_degraded").set(1.0);
            self.push(
                DiagnosticLevel::Error,
                "storage",
                "Spool degraded to memory-only until restart".to_string(),
            );
        }
    }

    /// Record anything else worth keeping (configuration errors, lifecycle)
    pub fn note(&self, level: DiagnosticLevel, kind: &'static str, message: impl Into<String>) {
        self.push(level, kind, message.into());
    }

    fn push(&self, level: DiagnosticLevel, kind: &'static str, message: String) {
        let mut recent = self.recent.lock();
        if recent.len() == DIAGNOSTIC_HISTORY {
            recent.pop_front();
        }
        recent.push_back(DiagnosticRecord {
            level,
            kind,
            message,
            at_ms: Utc::now().timestamp_millis(),
        });
    }

    /// Most recent records, oldest first
    pub fn recent(&self) -> Vec<DiagnosticRecord> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            events_recorded: self.events_recorded.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Acquire),
        }
    }
}

fn drop_message(count: u64, reason: &str) -> String {
    match reason {
        "queue_overflow" => AnalyticsError::QueueOverflow { dropped: count }.to_string(),
        "spool_eviction" => format!("Spool full: {} oldest event(s) evicted", count),
        "spool_write_failed" => format!("Spool write failed: {} event(s) discarded", count),
        other => format!("{} event(s) dropped ({})", count, other),
    }
}

// src/delivery/flush_engine.rs
//! Flush engine: spool → Sender
//!
//! One cycle persists whatever is still queued, checks the network policy
//! and the backoff gate, then sends the pending spool entries batch by
//! batch. The spool is the only source of truth for retries: a failed batch
//! is reverted to pending in place and picked up again by a later cycle.
//!
//! Cycles are serialized by the retry-state lock, so a manual trigger that
//! arrives mid-cycle waits for the running cycle to finish.

use crate::delivery::backoff::BackoffPolicy;
use crate::delivery::batch::{plan_batches, BatchLimits, Envelope};
use crate::delivery::network::{NetworkMonitor, NetworkStatus};
use crate::delivery::sender::{OutboundBatch, SendOutcome, Sender};
use crate::observability::Diagnostics;
use crate::recording::recorder::EventRecorder;
use crate::utils::config::ClientConfig;
use crate::utils::errors::AnalyticsError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Flush tuning, extracted from [`ClientConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushSettings {
    pub limits: BatchLimits,
    pub send_timeout: Duration,
    pub evict_on_cellular: bool,
    pub backoff: BackoffPolicy,
}

impl FlushSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            limits: BatchLimits {
                max_events: config.max_batch_events,
                max_payload_bytes: config.max_payload_bytes,
            },
            send_timeout: config.send_timeout(),
            evict_on_cellular: config.evict_on_cellular,
            backoff: config.backoff_policy(),
        }
    }
}

/// Why a cycle was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Timer tick; honors the backoff gate
    Scheduled,

    /// Explicit `flush()`; bypasses the backoff gate
    Manual,

    /// Final cycle before the worker exits
    Shutdown,
}

/// Why a cycle did not send anything
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Metered,
    Offline,
    BackingOff { remaining: Duration },
    Storage(String),
    Encoding(String),
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing pending
    Idle,

    /// Every pending batch was acknowledged or rejected
    Completed,

    Skipped(SkipReason),

    /// A retryable failure stopped the cycle
    Deferred { retry_in: Duration },

    /// Shutdown or restart interrupted the cycle
    Cancelled,
}

/// Summary of one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub batches_sent: usize,
    pub events_sent: usize,
    pub batches_rejected: usize,
}

impl CycleReport {
    fn new(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            batches_sent: 0,
            events_sent: 0,
            batches_rejected: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RetryState {
    consecutive_failures: u32,
    next_attempt_at: Option<Instant>,
}

/// Drains the spool into the sender
pub struct FlushEngine {
    recorder: Arc<EventRecorder>,
    sender: Arc<dyn Sender>,
    network: Arc<dyn NetworkMonitor>,
    envelope: Envelope,
    settings: FlushSettings,
    diagnostics: Arc<Diagnostics>,
    retry: Mutex<RetryState>,
}

impl FlushEngine {
    pub fn new(
        recorder: Arc<EventRecorder>,
        sender: Arc<dyn Sender>,
        network: Arc<dyn NetworkMonitor>,
        envelope: Envelope,
        settings: FlushSettings,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            recorder,
            sender,
            network,
            envelope,
            settings,
            diagnostics,
            retry: Mutex::new(RetryState::default()),
        }
    }

    /// Run one flush cycle
    pub async fn run_cycle(&self, trigger: FlushTrigger, cancel: &CancellationToken) -> CycleReport {
        let mut retry = self.retry.lock().await;

        self.recorder.persist();

        match self.network.status() {
            NetworkStatus::Offline => {
                debug!("Network offline, skipping flush");
                return CycleReport::new(CycleOutcome::Skipped(SkipReason::Offline));
            }
            NetworkStatus::Metered if self.settings.evict_on_cellular => {
                debug!("Network metered, deferring flush");
                return CycleReport::new(CycleOutcome::Skipped(SkipReason::Metered));
            }
            _ => {}
        }

        if trigger == FlushTrigger::Scheduled {
            if let Some(at) = retry.next_attempt_at {
                let now = Instant::now();
                if now < at {
                    return CycleReport::new(CycleOutcome::Skipped(SkipReason::BackingOff {
                        remaining: at - now,
                    }));
                }
            }
        }

        let pending = match self.recorder.with_spool(|spool| spool.recover_pending()) {
            Ok(pending) => pending,
            Err(e) => {
                error!("Could not read pending spool entries: {}", e);
                return CycleReport::new(CycleOutcome::Skipped(SkipReason::Storage(e.to_string())));
            }
        };
        if pending.is_empty() {
            return CycleReport::new(CycleOutcome::Idle);
        }

        let batches = match plan_batches(pending, &self.envelope, self.settings.limits) {
            Ok(batches) => batches,
            Err(e) => {
                error!("Could not encode pending batches: {}", e);
                return CycleReport::new(CycleOutcome::Skipped(SkipReason::Encoding(e.to_string())));
            }
        };

        debug!("Flush cycle ({:?}): {} batch(es) to send", trigger, batches.len());
        let mut report = CycleReport::new(CycleOutcome::Completed);

        for batch in batches {
            if cancel.is_cancelled() {
                report.outcome = CycleOutcome::Cancelled;
                return report;
            }

            if let Err(e) = self.recorder.with_spool(|spool| spool.mark_in_flight(&batch.sequences)) {
                report.outcome = CycleOutcome::Skipped(SkipReason::Storage(e.to_string()));
                return report;
            }

            match self.send(&batch, cancel).await {
                Some(SendOutcome::Success) => {
                    self.acknowledge(&batch);
                    self.diagnostics.batch_sent(batch.event_count() as u64);
                    report.batches_sent += 1;
                    report.events_sent += batch.event_count();
                    *retry = RetryState::default();
                }
                Some(SendOutcome::PermanentFailure(reason)) => {
                    error!(
                        "Collector rejected batch {:?} ({} events), dropping: {}",
                        batch.sequences,
                        batch.event_count(),
                        reason
                    );
                    self.acknowledge(&batch);
                    self.diagnostics
                        .batch_rejected(batch.event_count() as u64, &AnalyticsError::permanent(reason));
                    report.batches_rejected += 1;
                }
                Some(SendOutcome::RetryableFailure(reason)) => {
                    self.revert(&batch);
                    self.diagnostics.send_failed(&AnalyticsError::retryable(reason.as_str()));

                    retry.consecutive_failures += 1;
                    let delay = self.settings.backoff.delay(retry.consecutive_failures);
                    retry.next_attempt_at = Some(Instant::now() + delay);

                    warn!(
                        "Send failed ({} consecutive), retrying in {:?}: {}",
                        retry.consecutive_failures, delay, reason
                    );
                    report.outcome = CycleOutcome::Deferred { retry_in: delay };
                    return report;
                }
                None => {
                    info!("Flush cancelled, batch {:?} returned to pending", batch.sequences);
                    self.revert(&batch);
                    report.outcome = CycleOutcome::Cancelled;
                    return report;
                }
            }
        }

        report
    }

    /// Send with timeout; `None` when cancelled
    async fn send(&self, batch: &OutboundBatch, cancel: &CancellationToken) -> Option<SendOutcome> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.settings.send_timeout, self.sender.send(batch)) => {
                Some(result.unwrap_or_else(|_| {
                    SendOutcome::RetryableFailure(format!(
                        "send timed out after {:?}",
                        self.settings.send_timeout
                    ))
                }))
            }
        }
    }

    fn acknowledge(&self, batch: &OutboundBatch) {
        if let Err(e) = self.recorder.with_spool(|spool| spool.mark_acknowledged(&batch.sequences)) {
            // Entries stay pending and will be sent again: at-least-once.
            error!("Could not acknowledge batch {:?}: {}", batch.sequences, e);
        }
    }

    fn revert(&self, batch: &OutboundBatch) {
        if let Err(e) = self.recorder.with_spool(|spool| spool.mark_pending(&batch.sequences)) {
            error!("Could not revert batch {:?} to pending: {}", batch.sequences, e);
        }
    }

    /// Consecutive retryable failures since the last success
    pub async fn consecutive_failures(&self) -> u32 {
        self.retry.lock().await.consecutive_failures
    }
}

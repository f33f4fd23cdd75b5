// src/delivery/worker.rs
//! Background worker
//!
//! One OS thread named `analytics-worker` running a current-thread tokio
//! runtime. It owns the flush timer and the session tick timer, and is the
//! only place network calls happen. Caller threads talk to it through an
//! unbounded command channel, so triggering a flush never blocks.
//!
//! Shutdown order: cancel the token (interrupting any in-flight send), emit
//! the final session event, run one last bounded flush cycle, exit.

use crate::delivery::flush_engine::{CycleReport, FlushEngine, FlushTrigger};
use crate::recording::recorder::EventRecorder;
use crate::session::SessionTracker;
use crate::utils::errors::{AnalyticsError, Result};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const WORKER_THREAD_NAME: &str = "analytics-worker";

/// Timer periods for the worker loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSchedule {
    pub flush_interval: Duration,
    pub update_interval: Duration,
    pub shutdown_timeout: Duration,
}

enum WorkerCommand {
    Flush {
        reply: Option<std_mpsc::SyncSender<CycleReport>>,
    },
}

/// Cloneable trigger for the worker's flush cycles
#[derive(Clone)]
pub struct FlushHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl FlushHandle {
    /// Ask for an immediate flush cycle
    pub fn trigger_flush(&self) {
        if self.commands.send(WorkerCommand::Flush { reply: None }).is_err() {
            warn!("Flush requested but the worker has exited");
        }
    }

    /// Run a flush cycle and wait up to `timeout` for its report
    pub fn flush_and_wait(&self, timeout: Duration) -> Option<CycleReport> {
        let (reply, report) = std_mpsc::sync_channel(1);
        if self.commands.send(WorkerCommand::Flush { reply: Some(reply) }).is_err() {
            warn!("Flush requested but the worker has exited");
            return None;
        }
        report.recv_timeout(timeout).ok()
    }
}

/// Owns the worker thread
pub struct FlushWorker {
    flush: FlushHandle,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    /// Spawn the worker thread
    pub fn spawn(
        engine: Arc<FlushEngine>,
        recorder: Arc<EventRecorder>,
        tracker: Arc<SessionTracker>,
        schedule: WorkerSchedule,
    ) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build worker runtime: {}", e);
                        return;
                    }
                };

                let worker = WorkerLoop {
                    engine,
                    recorder,
                    tracker,
                    schedule,
                };
                runtime.block_on(worker.run(receiver, worker_cancel));
            })
            .map_err(AnalyticsError::Io)?;

        info!(
            "Flush worker started (flush every {:?}, session update every {:?})",
            schedule.flush_interval, schedule.update_interval
        );

        Ok(Self {
            flush: FlushHandle { commands },
            cancel,
            handle: Some(handle),
        })
    }

    pub fn flush_handle(&self) -> FlushHandle {
        self.flush.clone()
    }

    pub fn trigger_flush(&self) {
        self.flush.trigger_flush();
    }

    pub fn flush_and_wait(&self, timeout: Duration) -> Option<CycleReport> {
        self.flush.flush_and_wait(timeout)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Stop the worker and wait for its final cycle
    pub fn shutdown(&mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Flush worker panicked");
            }
            info!("Flush worker stopped");
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct WorkerLoop {
    engine: Arc<FlushEngine>,
    recorder: Arc<EventRecorder>,
    tracker: Arc<SessionTracker>,
    schedule: WorkerSchedule,
}

impl WorkerLoop {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>, cancel: CancellationToken) {
        let mut flush_timer = time::interval_at(
            Instant::now() + self.schedule.flush_interval,
            self.schedule.flush_interval,
        );
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut session_timer = time::interval_at(
            Instant::now() + self.schedule.update_interval,
            self.schedule.update_interval,
        );
        session_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = flush_timer.tick() => {
                    let report = self.engine.run_cycle(FlushTrigger::Scheduled, &cancel).await;
                    debug!("Scheduled flush: {:?}", report.outcome);
                }
                _ = session_timer.tick() => {
                    if let Some(event) = self.tracker.tick() {
                        self.recorder.record(event);
                    }
                }
                command = commands.recv() => match command {
                    Some(WorkerCommand::Flush { reply }) => {
                        let report = self.engine.run_cycle(FlushTrigger::Manual, &cancel).await;
                        debug!("Manual flush: {:?}", report.outcome);
                        if let Some(reply) = reply {
                            let _ = reply.try_send(report);
                        }
                    }
                    None => break,
                },
            }
        }

        self.finish(&mut commands).await;
    }

    async fn finish(&self, commands: &mut mpsc::UnboundedReceiver<WorkerCommand>) {
        if let Some(event) = self.tracker.stop() {
            self.recorder.record(event);
        }

        let deadline = CancellationToken::new();
        let timer = {
            let deadline = deadline.clone();
            let timeout = self.schedule.shutdown_timeout;
            tokio::spawn(async move {
                time::sleep(timeout).await;
                deadline.cancel();
            })
        };

        let report = self.engine.run_cycle(FlushTrigger::Shutdown, &deadline).await;
        timer.abort();
        info!(
            "Final flush: {:?}, {} events sent",
            report.outcome, report.events_sent
        );

        // Waiters queued behind the shutdown get the final report.
        commands.close();
        while let Ok(WorkerCommand::Flush { reply }) = commands.try_recv() {
            if let Some(reply) = reply {
                let _ = reply.try_send(report.clone());
            }
        }
    }
}

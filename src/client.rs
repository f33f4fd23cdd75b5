// src/client.rs
//! Public client API
//!
//! [`AnalyticsClient`] ties the pipeline together: queue, spool, recorder,
//! session tracker and the flush worker. Nothing here returns an error or
//! panics. Failures are logged and kept in [`Diagnostics`].
//!
//! Events recorded before `start` wait in the queue and are persisted as
//! soon as a pipeline exists. Calling `start` again stops the current
//! worker (final session event, final flush) and starts a new one.

use crate::delivery::batch::Envelope;
use crate::delivery::flush_engine::{CycleReport, FlushEngine, FlushSettings};
use crate::delivery::network::{NetworkMonitor, SharedNetworkStatus};
use crate::delivery::sender::Sender;
use crate::delivery::worker::{FlushHandle, FlushWorker, WorkerSchedule};
use crate::observability::{DiagnosticLevel, DiagnosticRecord, Diagnostics, DiagnosticsSnapshot};
use crate::recording::event::{EventOptions, EventRecord};
use crate::recording::event_queue::{EventQueue, QueueStats, DEFAULT_QUEUE_CAPACITY};
use crate::recording::recorder::EventRecorder;
use crate::recording::spool::DurableSpool;
use crate::session::{Session, SessionTracker};
use crate::transport::HttpSender;
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::config::ClientConfig;
use crate::utils::errors::{AnalyticsError, Result};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

static INSTANCE: OnceCell<AnalyticsClient> = OnceCell::new();
static EXIT_HOOK: Once = Once::new();

/// Longest the exit hook waits for a concurrent `start`/`shutdown`
const EXIT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

extern "C" fn flush_at_exit() {
    if let Some(client) = INSTANCE.get() {
        client.shutdown_at_exit();
    }
}

fn register_exit_hook() {
    EXIT_HOOK.call_once(|| {
        // SAFETY: `flush_at_exit` is a plain `extern "C" fn()` with no
        // captured state, which is what `atexit` expects.
        let rc = unsafe { libc::atexit(flush_at_exit) };
        if rc != 0 {
            warn!("Could not register exit hook, call shutdown() explicitly");
        }
    });
}

/// Optional collaborators for [`AnalyticsClient::start_with`]
///
/// Anything left `None` gets the production default: [`HttpSender`], an
/// always-unmetered network status, the system clock.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub sender: Option<Arc<dyn Sender>>,
    pub network: Option<Arc<dyn NetworkMonitor>>,
    pub clock: Option<Arc<dyn Clock>>,
}

impl Collaborators {
    pub fn sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

struct Running {
    config: ClientConfig,
    recorder: Arc<EventRecorder>,
    spool: Arc<DurableSpool>,
    tracker: Arc<SessionTracker>,
    flush: FlushHandle,
    worker: FlushWorker,
    device_id: String,
}

/// Analytics client
pub struct AnalyticsClient {
    diagnostics: Arc<Diagnostics>,
    queue: RwLock<Arc<EventQueue>>,
    clock: RwLock<Arc<dyn Clock>>,

    /// Serializes `start` and `shutdown`
    lifecycle: Mutex<()>,

    /// Held shared by `record_event` from recorder lookup until the record
    /// is spooled; `start` holds it exclusively while it takes the old pipeline
    swap: RwLock<()>,

    running: Mutex<Option<Running>>,
}

impl AnalyticsClient {
    pub fn new() -> Self {
        Self {
            diagnostics: Arc::new(Diagnostics::new()),
            queue: RwLock::new(Arc::new(EventQueue::new(DEFAULT_QUEUE_CAPACITY))),
            clock: RwLock::new(Arc::new(SystemClock::new())),
            lifecycle: Mutex::new(()),
            swap: RwLock::new(()),
            running: Mutex::new(None),
        }
    }

    /// Process-wide instance, created on first use
    pub fn shared() -> &'static AnalyticsClient {
        INSTANCE.get_or_init(AnalyticsClient::new)
    }

    /// Start with the production collaborators
    pub fn start(&self, config: ClientConfig) {
        self.start_with(config, Collaborators::default());
    }

    /// Start from a string attribute map (see `utils::config::ATTR_*`)
    pub fn start_with_attributes(&self, attributes: &HashMap<String, String>) {
        match ClientConfig::from_attributes(attributes) {
            Ok(config) => self.start(config),
            Err(e) => self.reject_start(&e),
        }
    }

    /// Start with injected collaborators
    ///
    /// Invalid configuration leaves the client exactly as it was.
    pub fn start_with(&self, config: ClientConfig, collaborators: Collaborators) {
        let _lifecycle = self.lifecycle.lock();

        if let Err(e) = config.validate() {
            self.reject_start(&e);
            return;
        }

        let sender = match collaborators.sender {
            Some(sender) => sender,
            None => match HttpSender::new(&config) {
                Ok(sender) => Arc::new(sender) as Arc<dyn Sender>,
                Err(e) => {
                    self.reject_start(&e);
                    return;
                }
            },
        };
        let network = collaborators
            .network
            .unwrap_or_else(|| Arc::new(SharedNetworkStatus::default()) as Arc<dyn NetworkMonitor>);
        if let Some(clock) = collaborators.clock {
            *self.clock.write() = clock;
        }
        let clock = Arc::clone(&*self.clock.read());

        let previous = {
            let _swap = self.swap.write();
            self.running.lock().take()
        };
        let previous = previous.map(|mut running| {
            info!("Restarting analytics client");
            running.worker.shutdown();
            running
        });

        let queue = self.resize_queue(config.queue_capacity);
        let spool = self.spool_for(&config, previous.as_ref());

        let recorder = Arc::new(EventRecorder::new(
            queue,
            Arc::clone(&spool),
            Arc::clone(&self.diagnostics),
            config.max_batch_events,
        ));
        if let Some(previous) = &previous {
            previous.recorder.retire(Arc::clone(&recorder));
        }

        let device_id = match recorder.with_spool(|spool| spool.installation_id()) {
            Ok(id) => id,
            Err(e) => {
                error!("Could not read installation id, using a per-process id: {}", e);
                self.diagnostics.storage_error(&e);
                Ulid::new().to_string()
            }
        };

        let engine = Arc::new(FlushEngine::new(
            Arc::clone(&recorder),
            sender,
            network,
            Envelope {
                app_key: config.api_key.clone(),
                device_id: device_id.clone(),
            },
            FlushSettings::from_config(&config),
            Arc::clone(&self.diagnostics),
        ));

        let tracker = Arc::new(SessionTracker::new(clock, config.session_tracking_enabled));
        if let Some(event) = tracker.start() {
            recorder.record(event);
        }
        recorder.persist();

        let schedule = WorkerSchedule {
            flush_interval: config.flush_interval(),
            update_interval: config.update_interval(),
            shutdown_timeout: config.shutdown_timeout(),
        };
        let worker = match FlushWorker::spawn(engine, Arc::clone(&recorder), Arc::clone(&tracker), schedule) {
            Ok(worker) => worker,
            Err(e) => {
                error!("Could not start flush worker: {}", e);
                self.diagnostics
                    .note(DiagnosticLevel::Error, "lifecycle", format!("worker spawn failed: {}", e));
                return;
            }
        };

        // Anything already spooled (pre-start events, entries from a
        // previous run) goes out without waiting for the first tick.
        if !spool.is_empty().unwrap_or(true) {
            worker.trigger_flush();
        }

        register_exit_hook();

        info!(
            "Analytics client started (host={}, device_id={}, durable={}, session_tracking={})",
            config.host,
            device_id,
            spool.is_durable(),
            config.session_tracking_enabled
        );
        self.diagnostics
            .note(DiagnosticLevel::Info, "lifecycle", format!("started for {}", config.host));

        *self.running.lock() = Some(Running {
            config,
            recorder,
            spool,
            tracker,
            flush: worker.flush_handle(),
            worker,
            device_id,
        });
    }

    fn reject_start(&self, error: &AnalyticsError) {
        error!("Analytics client not started: {}", error);
        self.diagnostics
            .note(DiagnosticLevel::Error, error.kind(), format!("start rejected: {}", error));
    }

    /// Replace the queue if the capacity changed, carrying its records over
    fn resize_queue(&self, capacity: usize) -> Arc<EventQueue> {
        let mut queue = self.queue.write();
        if queue.capacity() != capacity {
            let resized = Arc::new(EventQueue::new(capacity));
            let mut dropped = 0u64;
            for record in queue.drain(queue.capacity()) {
                if resized.enqueue(record).is_some() {
                    dropped += 1;
                }
            }
            self.diagnostics.events_dropped(dropped, "queue_overflow");
            *queue = resized;
        }
        Arc::clone(&*queue)
    }

    /// Pick the spool for a new configuration
    ///
    /// Same storage directory reuses the open spool. Otherwise a new one is
    /// opened and pending entries from the old one are moved across.
    fn spool_for(&self, config: &ClientConfig, previous: Option<&Running>) -> Arc<DurableSpool> {
        if let Some(previous) = previous {
            if previous.config.storage_dir == config.storage_dir {
                return Arc::clone(&previous.spool);
            }
        }

        let spool = match &config.storage_dir {
            Some(_) if self.diagnostics.snapshot().degraded => {
                warn!("Spool degraded earlier in this process, staying in memory");
                DurableSpool::memory(config.max_spool_entries)
            }
            Some(dir) => match DurableSpool::open(dir, config.max_spool_entries) {
                Ok(spool) => spool,
                Err(e) => {
                    error!("Could not open spool in {:?}, falling back to memory: {}", dir, e);
                    self.diagnostics.storage_error(&e);
                    self.diagnostics.mark_degraded();
                    DurableSpool::memory(config.max_spool_entries)
                }
            },
            None => DurableSpool::memory(config.max_spool_entries),
        };

        if let Some(previous) = previous {
            if let Err(e) = migrate_pending(&previous.spool, &spool) {
                warn!("Could not move pending entries to the new spool: {}", e);
                self.diagnostics.storage_error(&e);
            }
        }

        Arc::new(spool)
    }

    /// Record an event
    pub fn record_event(&self, key: &str, options: EventOptions) {
        let timestamp = self.clock.read().now();
        let record = match EventRecord::new(key, options, timestamp) {
            Ok(record) => record,
            Err(e) => {
                warn!("Rejected event '{}': {}", key, e);
                self.diagnostics.event_rejected(&e);
                return;
            }
        };

        let _swap = self.swap.read();
        let recorder = self.running.lock().as_ref().map(|r| Arc::clone(&r.recorder));
        match recorder {
            Some(recorder) => recorder.record(record),
            None => {
                let queue = self.queue.read();
                if let Some(evicted) = queue.enqueue(record) {
                    warn!("Event queue full before start, evicted '{}'", evicted.key());
                    self.diagnostics.events_dropped(1, "queue_overflow");
                }
                self.diagnostics.event_recorded();
            }
        }
    }

    /// Record a single occurrence with no sum or segmentation
    pub fn record(&self, key: &str) {
        self.record_event(key, EventOptions::new());
    }

    /// Trigger an immediate flush on the worker
    pub fn flush(&self) {
        match self.flush_handle() {
            Some(flush) => flush.trigger_flush(),
            None => debug!("Flush requested before start, events stay queued"),
        }
    }

    /// Flush and wait up to `timeout` for the cycle to finish
    pub fn flush_and_wait(&self, timeout: Duration) -> Option<CycleReport> {
        self.flush_handle()?.flush_and_wait(timeout)
    }

    fn flush_handle(&self) -> Option<FlushHandle> {
        self.running.lock().as_ref().map(|r| r.flush.clone())
    }

    /// Stop the worker after a final session event and bounded flush
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.stop_running();
    }

    fn shutdown_at_exit(&self) {
        match self.lifecycle.try_lock_for(EXIT_LOCK_TIMEOUT) {
            Some(_lifecycle) => self.stop_running(),
            None => warn!("Client busy at exit, skipping final flush"),
        }
    }

    fn stop_running(&self) {
        let running = self.running.lock().take();
        if let Some(mut running) = running {
            running.worker.shutdown();
            let remaining = running.spool.len().unwrap_or(0);
            info!("Analytics client stopped, {} spool entries pending", remaining);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn recent_diagnostics(&self) -> Vec<DiagnosticRecord> {
        self.diagnostics.recent()
    }

    /// Device identifier sent with every request
    pub fn installation_id(&self) -> Option<String> {
        self.running.lock().as_ref().map(|r| r.device_id.clone())
    }

    pub fn session(&self) -> Option<Session> {
        self.running.lock().as_ref().and_then(|r| r.tracker.session())
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.read().stats()
    }

    /// Spool entries not yet acknowledged (0 before start)
    pub fn pending_entries(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .and_then(|r| r.spool.len().ok())
            .unwrap_or(0)
    }
}

impl Default for AnalyticsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AnalyticsClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn migrate_pending(from: &DurableSpool, to: &DurableSpool) -> Result<usize> {
    let pending = from.recover_pending()?;
    let mut moved = 0;
    for entry in &pending {
        to.append(&entry.events)?;
        from.mark_acknowledged(&[entry.sequence])?;
        moved += entry.events.len();
    }
    if moved > 0 {
        info!("Moved {} pending events to the new spool", moved);
    }
    Ok(moved)
}

// src/session/tracker.rs
//! Session duration tracking
//!
//! Two states: Inactive and Active. Each tick while Active yields a
//! `[CLY]_session_duration` event whose `sum` is the number of seconds since
//! the previous tick (or since the session began). Stopping yields a final
//! event for the partial interval, so the durations of one session add up
//! to its total length.

use crate::recording::event::{EventOptions, EventRecord, SESSION_DURATION_KEY};
use crate::utils::clock::{Clock, Timestamp};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use ulid::Ulid;

/// Segmentation key carrying the session id on duration events
pub const SESSION_ID_SEGMENT: &str = "session_id";

/// An active session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub started_at: Timestamp,
    pub last_update: Timestamp,
}

#[derive(Debug)]
enum TrackerState {
    Inactive,
    Active(Session),
}

/// Tracks the current session and produces duration events
pub struct SessionTracker {
    clock: Arc<dyn Clock>,
    enabled: bool,
    state: Mutex<TrackerState>,
}

impl SessionTracker {
    /// `enabled = false` keeps session state but never emits events
    pub fn new(clock: Arc<dyn Clock>, enabled: bool) -> Self {
        Self {
            clock,
            enabled,
            state: Mutex::new(TrackerState::Inactive),
        }
    }

    /// Begin a new session
    ///
    /// If one is already active it is ended first and its final duration
    /// event is returned.
    pub fn start(&self) -> Option<EventRecord> {
        let mut state = self.state.lock();
        let now = self.clock.now();

        let previous = match &*state {
            TrackerState::Active(session) => {
                info!("Ending session {} before starting a new one", session.id);
                self.duration_event(session, now)
            }
            TrackerState::Inactive => None,
        };

        let session = Session {
            id: Ulid::new().to_string(),
            started_at: now,
            last_update: now,
        };
        info!("Session {} started", session.id);
        *state = TrackerState::Active(session);

        previous
    }

    /// Emit the duration accumulated since the last update
    pub fn tick(&self) -> Option<EventRecord> {
        let mut state = self.state.lock();
        let now = self.clock.now();

        match &mut *state {
            TrackerState::Active(session) => {
                let event = self.duration_event(session, now);
                session.last_update = now;
                event
            }
            TrackerState::Inactive => None,
        }
    }

    /// End the session, emitting the partial interval
    pub fn stop(&self) -> Option<EventRecord> {
        let mut state = self.state.lock();
        let now = self.clock.now();

        match std::mem::replace(&mut *state, TrackerState::Inactive) {
            TrackerState::Active(session) => {
                info!(
                    "Session {} ended after {:?}",
                    session.id,
                    now.duration_since(&session.started_at)
                );
                self.duration_event(&session, now)
            }
            TrackerState::Inactive => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.state.lock(), TrackerState::Active(_))
    }

    pub fn session(&self) -> Option<Session> {
        match &*self.state.lock() {
            TrackerState::Active(session) => Some(session.clone()),
            TrackerState::Inactive => None,
        }
    }

    fn duration_event(&self, session: &Session, now: Timestamp) -> Option<EventRecord> {
        if !self.enabled {
            return None;
        }

        let elapsed = now.duration_since(&session.last_update);
        debug!("Session {} duration update: {:?}", session.id, elapsed);

        EventRecord::new(
            SESSION_DURATION_KEY,
            EventOptions::new()
                .sum(seconds(elapsed))
                .segment(SESSION_ID_SEGMENT, session.id.clone()),
            now,
        )
        .ok()
    }
}

fn seconds(duration: Duration) -> f64 {
    (duration.as_millis() as f64) / 1000.0
}

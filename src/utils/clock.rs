// src/utils/clock.rs
//! Time sources
//!
//! Every timestamp carries both a wall clock reading (sent to the collector)
//! and a monotonic reading (used for durations, immune to clock changes).

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Wall + monotonic clock pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Milliseconds since the Unix epoch
    pub wall_ms: i64,

    /// Nanoseconds since the clock's anchor
    pub monotonic_ns: u64,
}

impl Timestamp {
    /// Monotonic time elapsed since `earlier` (zero if `earlier` is later)
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        Duration::from_nanos(self.monotonic_ns.saturating_sub(earlier.monotonic_ns))
    }
}

/// Source of timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Production clock anchored at construction
pub struct SystemClock {
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp {
            wall_ms: Utc::now().timestamp_millis(),
            monotonic_ns: self.anchor.elapsed().as_nanos() as u64,
        }
    }
}

/// Hand-driven clock for tests
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Start at the given wall time with a zero monotonic reading
    pub fn new(wall_ms: i64) -> Self {
        Self {
            now: Mutex::new(Timestamp {
                wall_ms,
                monotonic_ns: 0,
            }),
        }
    }

    /// Move both readings forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        now.wall_ms += by.as_millis() as i64;
        now.monotonic_ns += by.as_nanos() as u64;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

// src/utils/mod.rs
//! Shared plumbing: errors, configuration, clocks

pub mod clock;
pub mod config;
pub mod errors;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::ClientConfig;
pub use errors::{AnalyticsError, NetworkErrorKind, Result};

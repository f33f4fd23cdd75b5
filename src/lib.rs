// src/lib.rs
//! Analytics Client Core
//!
//! Event recording and delivery for an analytics client: a bounded
//! in-memory queue, a durable spool that survives restarts, a flush engine
//! with retry and backoff, and session duration tracking.
//!
//! # Architecture
//!
//! - **client**: public API and process-wide instance
//! - **recording**: event records, queue, spool, recorder
//! - **session**: session state machine and duration events
//! - **delivery**: batching, backoff, flush cycles, background worker
//! - **transport**: reference HTTP sender
//! - **observability**: tracing, metrics, diagnostics
//! - **utils**: errors, configuration, clocks
//!
//! # Example
//!
//! ```no_run
//! use analytics_core::{AnalyticsClient, ClientConfig, EventOptions};
//!
//! let client = AnalyticsClient::shared();
//! client.start(ClientConfig::new("app-key", "http://collector.example.com"));
//! client.record_event("purchase", EventOptions::new().count(2).sum(9.99));
//! client.flush();
//! client.shutdown();
//! ```

pub mod client;
pub mod delivery;
pub mod observability;
pub mod recording;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use client::{AnalyticsClient, Collaborators};
pub use delivery::{NetworkMonitor, NetworkStatus, OutboundBatch, SendOutcome, Sender, SharedNetworkStatus};
pub use recording::{EventOptions, EventRecord, Segmentation};
pub use utils::clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use utils::config::ClientConfig;
pub use utils::errors::{AnalyticsError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_shared_is_singleton() {
        let a = AnalyticsClient::shared() as *const AnalyticsClient;
        let b = AnalyticsClient::shared() as *const AnalyticsClient;
        assert_eq!(a, b);
    }
}

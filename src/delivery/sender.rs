// src/delivery/sender.rs
//! Transport contract used by the flush engine
//!
//! The engine never talks to the network itself. It hands an encoded
//! [`OutboundBatch`] to a [`Sender`] and acts on the [`SendOutcome`].

use crate::recording::event::EventRecord;
use async_trait::async_trait;
use bytes::Bytes;

/// A batch ready for transmission
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    /// Spool entries covered by this batch
    pub sequences: Vec<u64>,

    /// Events in transmission order
    pub events: Vec<EventRecord>,

    /// Encoded JSON request body
    pub body: Bytes,
}

impl OutboundBatch {
    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

/// What happened to a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the collector
    Success,

    /// Network error, timeout, 5xx-equivalent. Try again later.
    RetryableFailure(String),

    /// Malformed request or rejected credentials. Do not retry.
    PermanentFailure(String),
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Success)
    }
}

/// Transmits batches to the collector
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, batch: &OutboundBatch) -> SendOutcome;
}

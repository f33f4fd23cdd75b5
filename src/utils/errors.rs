// src/utils/errors.rs
//! Error types for the analytics core
//!
//! None of these cross the public client API. They travel between the
//! internal components and end up as log lines and diagnostic records.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Whether a network failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Network error, timeout, 5xx-equivalent
    Retryable,

    /// Malformed request, authentication rejected
    Permanent,
}

/// Errors raised inside the analytics pipeline
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// Invalid api key / host / tuning value. `start` is aborted.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Spool read or write could not be committed
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error ({kind:?}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Queue was full and older records were evicted
    #[error("Event queue overflow: {dropped} event(s) dropped")]
    QueueOverflow { dropped: u64 },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalyticsError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Network {
            kind: NetworkErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Network {
            kind: NetworkErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Short stable label, used as the diagnostic kind and metric label
    pub fn kind(&self) -> &'static str {
        match self {
            AnalyticsError::Configuration(_) => "configuration",
            AnalyticsError::Storage(_) => "storage",
            AnalyticsError::Network {
                kind: NetworkErrorKind::Retryable,
                ..
            } => "network_retryable",
            AnalyticsError::Network {
                kind: NetworkErrorKind::Permanent,
                ..
            } => "network_permanent",
            AnalyticsError::QueueOverflow { .. } => "queue_overflow",
            AnalyticsError::InvalidEvent(_) => "invalid_event",
            AnalyticsError::Serialization(_) => "serialization",
            AnalyticsError::Compression(_) => "compression",
            AnalyticsError::Io(_) => "io",
        }
    }
}

impl From<rusqlite::Error> for AnalyticsError {
    fn from(e: rusqlite::Error) -> Self {
        AnalyticsError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AnalyticsError {
    fn from(e: serde_json::Error) -> Self {
        AnalyticsError::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for AnalyticsError {
    fn from(e: config::ConfigError) -> Self {
        AnalyticsError::Configuration(e.to_string())
    }
}

// src/recording/event.rs
//! Recorded events
//!
//! An [`EventRecord`] is immutable once built. The public API does not
//! construct records directly; it passes a key and [`EventOptions`] through
//! [`EventRecord::new`], which applies the defaults and validation rules.

use crate::utils::clock::Timestamp;
use crate::utils::errors::{AnalyticsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key/value breakdown attached to an event. No ordering guarantee.
pub type Segmentation = HashMap<String, String>;

/// Key used for synthetic session duration events
pub const SESSION_DURATION_KEY: &str = "[CLY]_session_duration";

/// Optional parts of `record_event`
///
/// `count` defaults to 1. `sum` and `segmentation` are omitted from the
/// payload when absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventOptions {
    pub count: Option<u32>,
    pub sum: Option<f64>,
    pub segmentation: Option<Segmentation>,
}

impl EventOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn sum(mut self, sum: f64) -> Self {
        self.sum = Some(sum);
        self
    }

    pub fn segmentation(mut self, segmentation: Segmentation) -> Self {
        self.segmentation = Some(segmentation);
        self
    }

    /// Add a single segment, replacing any previous value for `key`
    pub fn segment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.segmentation
            .get_or_insert_with(Segmentation::new)
            .insert(key.into(), value.into());
        self
    }
}

/// One recorded occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    key: String,
    count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    segmentation: Option<Segmentation>,
    timestamp: Timestamp,
}

impl EventRecord {
    /// Validate and build a record
    pub fn new(key: impl Into<String>, options: EventOptions, timestamp: Timestamp) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(AnalyticsError::InvalidEvent("event key must not be empty".into()));
        }

        let count = options.count.unwrap_or(1);
        if count == 0 {
            return Err(AnalyticsError::InvalidEvent(format!(
                "event '{}' has count 0",
                key
            )));
        }

        if let Some(sum) = options.sum {
            if !sum.is_finite() {
                return Err(AnalyticsError::InvalidEvent(format!(
                    "event '{}' has non-finite sum",
                    key
                )));
            }
        }

        if options
            .segmentation
            .as_ref()
            .is_some_and(|s| s.keys().any(|k| k.is_empty()))
        {
            return Err(AnalyticsError::InvalidEvent(format!(
                "event '{}' has an empty segmentation key",
                key
            )));
        }

        let segmentation = options.segmentation.filter(|s| !s.is_empty());

        Ok(Self {
            key,
            count,
            sum: options.sum,
            segmentation,
            timestamp,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn sum(&self) -> Option<f64> {
        self.sum
    }

    pub fn segmentation(&self) -> Option<&Segmentation> {
        self.segmentation.as_ref()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

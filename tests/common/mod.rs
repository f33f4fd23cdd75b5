// tests/common/mod.rs
//! Shared fixtures for the integration tests

#![allow(dead_code)]

use analytics_core::{ClientConfig, OutboundBatch, SendOutcome, Sender};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Records every batch it accepts; replays scripted failures first
#[derive(Default)]
pub struct RecordingSender {
    script: Mutex<VecDeque<SendOutcome>>,
    payloads: Mutex<Vec<serde_json::Value>>,
    attempts: Mutex<usize>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(outcomes: Vec<SendOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            ..Default::default()
        }
    }

    /// Decoded request bodies in arrival order
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.payloads.lock().clone()
    }

    /// All delivered events, flattened
    pub fn events(&self) -> Vec<serde_json::Value> {
        self.payloads
            .lock()
            .iter()
            .flat_map(|p| p["events"].as_array().cloned().unwrap_or_default())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e["key"].as_str().map(str::to_string))
            .collect()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, batch: &OutboundBatch) -> SendOutcome {
        *self.attempts.lock() += 1;
        if let Some(outcome) = self.script.lock().pop_front() {
            return outcome;
        }

        let payload: serde_json::Value = serde_json::from_slice(&batch.body).expect("payload is JSON");
        self.payloads.lock().push(payload);
        SendOutcome::Success
    }
}

/// Configuration with timers long enough that only explicit flushes run
pub fn quiet_config() -> ClientConfig {
    let mut config = ClientConfig::new("test-app-key", "http://collector.test");
    config.session_tracking_enabled = false;
    config.flush_interval_secs = 3600;
    config.update_interval_secs = 3600;
    config.shutdown_timeout_secs = 2;
    config.backoff_jitter = 0.0;
    config
}

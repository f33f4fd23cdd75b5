// src/utils/config.rs
//! Client configuration
//!
//! Layered with the `config` crate: an optional file (`ANALYTICS_CONFIG`, or
//! `analytics.{toml,json,yaml}` in the working directory) overridden by
//! `ANALYTICS_*` environment variables. Every tuning field has a default, so
//! only `api_key` and `host` must be supplied.

use crate::delivery::backoff::BackoffPolicy;
use crate::utils::errors::{AnalyticsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "ANALYTICS_CONFIG";

/// Prefix for environment overrides (`ANALYTICS_API_KEY`, ...)
pub const ENV_PREFIX: &str = "ANALYTICS";

pub const ATTR_API_KEY: &str = "api_key";
pub const ATTR_HOST: &str = "host";
pub const ATTR_SESSION_TRACKING: &str = "session_tracking_enabled";
pub const ATTR_EVICT_ON_CELLULAR: &str = "evict_on_cellular";
pub const ATTR_UPDATE_INTERVAL: &str = "update_interval_secs";

const DEFAULT_CONFIG_FILE: &str = "analytics";

/// Configuration accepted by `start`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Application key issued by the collector
    pub api_key: String,

    /// Collector base URL, e.g. `https://analytics.example.com`
    pub host: String,

    /// Emit periodic session duration events
    #[serde(default = "default_true")]
    pub session_tracking_enabled: bool,

    /// Skip flushing while the active network is metered
    #[serde(default)]
    pub evict_on_cellular: bool,

    /// Session duration update interval (seconds)
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// In-memory queue capacity (events)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Scheduled flush interval (seconds)
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Maximum events per transmitted batch
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,

    /// Maximum encoded payload size per request (bytes)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Maximum spool entries kept before the oldest are evicted
    #[serde(default = "default_max_spool_entries")]
    pub max_spool_entries: usize,

    /// Per-attempt send timeout (seconds)
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// First retry delay (milliseconds)
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Retry delay cap (milliseconds)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Fraction of each delay that may be shaved off at random (0.0..=1.0)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Spool directory. `None` keeps the spool in memory.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Upper bound for the final flush on shutdown (seconds)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_update_interval_secs() -> u64 {
    120
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_max_batch_events() -> usize {
    100
}

fn default_max_payload_bytes() -> usize {
    256 * 1024
}

fn default_max_spool_entries() -> usize {
    10_000
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl ClientConfig {
    /// Build a configuration with defaults for everything but the required fields
    pub fn new(api_key: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            host: host.into(),
            session_tracking_enabled: true,
            evict_on_cellular: false,
            update_interval_secs: default_update_interval_secs(),
            queue_capacity: default_queue_capacity(),
            flush_interval_secs: default_flush_interval_secs(),
            max_batch_events: default_max_batch_events(),
            max_payload_bytes: default_max_payload_bytes(),
            max_spool_entries: default_max_spool_entries(),
            send_timeout_secs: default_send_timeout_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            storage_dir: None,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }

    /// Load configuration from file and environment, then validate it
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let config: ClientConfig = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from a string attribute map
    ///
    /// Keys are the field names (see the `ATTR_*` constants). Values are
    /// parsed into the field types; absent keys take their defaults.
    pub fn from_attributes(attributes: &HashMap<String, String>) -> Result<Self> {
        let mut builder = config::Config::builder();
        for (key, value) in attributes {
            builder = builder.set_override(key.as_str(), value.as_str())?;
        }

        let config: ClientConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and tuning bounds
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(AnalyticsError::Configuration("api_key must not be empty".into()));
        }

        self.collector_uri()?;

        if self.update_interval_secs == 0 {
            return Err(AnalyticsError::Configuration(
                "update_interval_secs must be at least 1".into(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(AnalyticsError::Configuration(
                "flush_interval_secs must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 || self.max_batch_events == 0 || self.max_spool_entries == 0 {
            return Err(AnalyticsError::Configuration(
                "queue_capacity, max_batch_events and max_spool_entries must be positive".into(),
            ));
        }
        if self.max_payload_bytes < 1024 {
            return Err(AnalyticsError::Configuration(
                "max_payload_bytes must be at least 1024".into(),
            ));
        }
        if self.send_timeout_secs == 0 {
            return Err(AnalyticsError::Configuration(
                "send_timeout_secs must be at least 1".into(),
            ));
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(AnalyticsError::Configuration(
                "backoff_initial_ms must be positive and not exceed backoff_max_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(AnalyticsError::Configuration(
                "backoff_jitter must be within 0.0..=1.0".into(),
            ));
        }

        Ok(())
    }

    /// Parsed collector base URI (absolute, http or https)
    pub fn collector_uri(&self) -> Result<hyper::Uri> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(AnalyticsError::Configuration("host must not be empty".into()));
        }

        let uri: hyper::Uri = host
            .parse()
            .map_err(|e| AnalyticsError::Configuration(format!("invalid host '{}': {}", host, e)))?;

        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => {
                return Err(AnalyticsError::Configuration(format!(
                    "host '{}' must use http or https",
                    host
                )))
            }
        }
        if uri.authority().is_none() {
            return Err(AnalyticsError::Configuration(format!(
                "host '{}' has no authority",
                host
            )));
        }

        Ok(uri)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.backoff_jitter,
        )
    }
}

// src/observability/mod.rs
//! Logging, metrics and the internal diagnostic record
//!
//! - **init_tracing**: `tracing-subscriber` with an env-driven filter
//! - **init_metrics**: Prometheus recorder for the `metrics` facade
//! - **Diagnostics**: counters and recent failures kept in-process

pub mod diagnostics;

pub use diagnostics::{DiagnosticLevel, DiagnosticRecord, Diagnostics, DiagnosticsSnapshot};

use crate::utils::errors::{AnalyticsError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::env;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,analytics_core=info";

/// Filter override checked after `RUST_LOG`
pub const LOG_FILTER_ENV: &str = "ANALYTICS_LOG";

/// `json` switches the formatter to JSON lines
pub const LOG_FORMAT_ENV: &str = "ANALYTICS_LOG_FORMAT";

/// Install the global tracing subscriber
///
/// Filter precedence: `RUST_LOG`, then `ANALYTICS_LOG`, then the default.
/// A subscriber that is already installed is left alone.
pub fn init_tracing() -> Result<()> {
    let filter = filter_from_env();
    let json = env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = installed {
        tracing::debug!("Tracing subscriber already installed: {}", e);
    }
    Ok(())
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(filter) = env::var(LOG_FILTER_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
    {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}

/// Install the Prometheus metrics recorder and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AnalyticsError::Configuration(format!("Failed to install metrics recorder: {}", e)))
}

// src/main.rs
//! Analytics CLI
//!
//! Records the events given on the command line and delivers them to the
//! configured collector.
//!
//! ```text
//! ANALYTICS_API_KEY=... ANALYTICS_HOST=http://collector:8080 \
//!     analytics-cli app_open purchase:2:9.99
//! ```

use analytics_core::observability::{init_metrics, init_tracing};
use analytics_core::{AnalyticsClient, ClientConfig, EventOptions};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Parse `key[:count[:sum]]`
fn parse_event(arg: &str) -> Result<(String, EventOptions)> {
    let mut parts = arg.splitn(3, ':');
    let key = parts.next().unwrap_or_default().to_string();
    if key.is_empty() {
        bail!("event '{}' has an empty key", arg);
    }

    let mut options = EventOptions::new();
    if let Some(count) = parts.next() {
        let count: u32 = count.parse().with_context(|| format!("invalid count in '{}'", arg))?;
        options = options.count(count);
    }
    if let Some(sum) = parts.next() {
        let sum: f64 = sum.parse().with_context(|| format!("invalid sum in '{}'", arg))?;
        options = options.sum(sum);
    }

    Ok((key, options))
}

fn main() -> Result<()> {
    init_tracing()?;
    let metrics = init_metrics()?;

    info!("Starting analytics-cli v{}", analytics_core::VERSION);

    let events = std::env::args()
        .skip(1)
        .map(|arg| parse_event(&arg))
        .collect::<Result<Vec<_>>>()?;

    let config = ClientConfig::load().context("Failed to load configuration")?;
    info!("Configuration loaded: host={}, storage_dir={:?}", config.host, config.storage_dir);
    let wait = config.send_timeout() + Duration::from_secs(1);

    let client = AnalyticsClient::shared();
    client.start(config);
    if !client.is_running() {
        bail!("Analytics client did not start, see log for details");
    }

    for (key, options) in events {
        client.record_event(&key, options);
    }

    match client.flush_and_wait(wait) {
        Some(report) => info!(
            "Flush finished: {:?} ({} events sent)",
            report.outcome, report.events_sent
        ),
        None => warn!("Flush did not finish within {:?}", wait),
    }

    let pending = client.pending_entries();
    client.shutdown();

    let diagnostics = client.diagnostics();
    info!(
        "Done: recorded={}, sent={}, dropped={}, pending={}",
        diagnostics.events_recorded,
        diagnostics.events_sent,
        diagnostics.events_dropped,
        pending
    );
    println!("{}", metrics.render());

    Ok(())
}

// src/delivery/batch.rs
//! Wire payloads and batch planning
//!
//! Pending spool entries are grouped into request-sized batches: at most
//! `max_events` events and `max_payload_bytes` of encoded body. An entry is
//! never split, so a single entry that exceeds the byte limit goes out alone.

use crate::delivery::sender::OutboundBatch;
use crate::recording::event::{EventRecord, Segmentation};
use crate::recording::spool::SpoolEntry;
use crate::utils::errors::Result;
use bytes::Bytes;
use chrono::{Datelike, Local, TimeZone, Timelike, Utc};
use serde::Serialize;

/// SDK name reported with every request
pub const SDK_NAME: &str = "analytics-core-rust";

/// Slack for the request timestamp, which is re-read when each body is encoded
const TIMESTAMP_MARGIN: usize = 24;

/// Identity attached to every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub app_key: String,
    pub device_id: String,
}

/// Size limits for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_events: usize,
    pub max_payload_bytes: usize,
}

#[derive(Serialize)]
struct WirePayload<'a> {
    app_key: &'a str,
    device_id: &'a str,
    timestamp: i64,
    sdk_name: &'static str,
    sdk_version: &'static str,
    events: Vec<WireEvent<'a>>,
}

#[derive(Serialize)]
struct WireEvent<'a> {
    key: &'a str,
    count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    segmentation: Option<&'a Segmentation>,
    timestamp: i64,
    hour: u32,
    dow: u32,
}

impl<'a> WireEvent<'a> {
    fn from_record(record: &'a EventRecord) -> Self {
        let wall_ms = record.timestamp().wall_ms;
        let (hour, dow) = hour_and_weekday(wall_ms);
        Self {
            key: record.key(),
            count: record.count(),
            sum: record.sum(),
            segmentation: record.segmentation(),
            timestamp: wall_ms,
            hour,
            dow,
        }
    }
}

/// Local hour of day and day of week (0 = Sunday)
fn hour_and_weekday(wall_ms: i64) -> (u32, u32) {
    match Local.timestamp_millis_opt(wall_ms).single() {
        Some(local) => (local.hour(), local.weekday().num_days_from_sunday()),
        None => Utc
            .timestamp_millis_opt(wall_ms)
            .single()
            .map(|utc| (utc.hour(), utc.weekday().num_days_from_sunday()))
            .unwrap_or((0, 0)),
    }
}

/// Encode a request body
pub fn encode_payload(envelope: &Envelope, events: &[EventRecord]) -> Result<Bytes> {
    let payload = WirePayload {
        app_key: &envelope.app_key,
        device_id: &envelope.device_id,
        timestamp: Utc::now().timestamp_millis(),
        sdk_name: SDK_NAME,
        sdk_version: crate::VERSION,
        events: events.iter().map(WireEvent::from_record).collect(),
    };
    Ok(Bytes::from(serde_json::to_vec(&payload)?))
}

/// Bytes the envelope takes around an empty event array
fn envelope_overhead(envelope: &Envelope) -> Result<usize> {
    Ok(encode_payload(envelope, &[])?.len() + TIMESTAMP_MARGIN)
}

fn encoded_event_size(record: &EventRecord) -> usize {
    // Serializing a borrowed wire event cannot fail; treat failure as huge.
    serde_json::to_vec(&WireEvent::from_record(record))
        .map(|v| v.len() + 1)
        .unwrap_or(usize::MAX / 2)
}

/// Group pending entries into request-sized batches, preserving order
pub fn plan_batches(
    entries: Vec<SpoolEntry>,
    envelope: &Envelope,
    limits: BatchLimits,
) -> Result<Vec<OutboundBatch>> {
    let byte_budget = limits.max_payload_bytes.saturating_sub(envelope_overhead(envelope)?);
    let mut planned = Vec::new();

    let mut sequences = Vec::new();
    let mut events: Vec<EventRecord> = Vec::new();
    let mut bytes = 0usize;

    for entry in entries {
        let entry_bytes: usize = entry.events.iter().map(encoded_event_size).sum();
        let over_events = events.len() + entry.events.len() > limits.max_events;
        let over_bytes = bytes + entry_bytes > byte_budget;

        if !events.is_empty() && (over_events || over_bytes) {
            let body = encode_payload(envelope, &events)?;
            planned.push(OutboundBatch {
                sequences: std::mem::take(&mut sequences),
                events: std::mem::take(&mut events),
                body,
            });
            bytes = 0;
        }

        sequences.push(entry.sequence);
        events.extend(entry.events);
        bytes += entry_bytes;
    }

    if !events.is_empty() {
        let body = encode_payload(envelope, &events)?;
        planned.push(OutboundBatch {
            sequences,
            events,
            body,
        });
    }

    Ok(planned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::event::EventOptions;
    use crate::recording::spool::EntryState;
    use crate::utils::clock::Timestamp;

    fn envelope() -> Envelope {
        Envelope {
            app_key: "app".to_string(),
            device_id: "device".to_string(),
        }
    }

    fn record(key: &str, options: EventOptions) -> EventRecord {
        EventRecord::new(
            key,
            options,
            Timestamp {
                wall_ms: 1_700_000_000_000,
                monotonic_ns: 0,
            },
        )
        .unwrap()
    }

    fn entry(sequence: u64, n: usize) -> SpoolEntry {
        SpoolEntry {
            sequence,
            events: (0..n).map(|i| record(&format!("evt_{}_{}", sequence, i), EventOptions::new())).collect(),
            state: EntryState::Pending,
            attempts: 0,
            created_at_ms: 0,
        }
    }

    #[test]
    fn test_payload_omits_absent_fields() {
        let events = vec![record("purchase", EventOptions::new().count(2).sum(9.99))];
        let body = encode_payload(&envelope(), &events).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["app_key"], "app");
        assert_eq!(json["device_id"], "device");
        assert_eq!(json["sdk_name"], SDK_NAME);

        let event = &json["events"][0];
        assert_eq!(event["key"], "purchase");
        assert_eq!(event["count"], 2);
        assert_eq!(event["sum"], 9.99);
        assert_eq!(event["timestamp"], 1_700_000_000_000i64);
        assert!(event.get("segmentation").is_none());
        assert!(event["hour"].as_u64().unwrap() < 24);
        assert!(event["dow"].as_u64().unwrap() < 7);
    }

    #[test]
    fn test_zero_sum_is_kept() {
        let events = vec![record("free_item", EventOptions::new().sum(0.0))];
        let body = encode_payload(&envelope(), &events).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["events"][0]["sum"], 0.0);
    }

    #[test]
    fn test_plan_respects_event_limit() {
        let limits = BatchLimits {
            max_events: 5,
            max_payload_bytes: 1 << 20,
        };
        let planned = plan_batches(vec![entry(1, 3), entry(2, 2), entry(3, 3)], &envelope(), limits).unwrap();

        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].sequences, vec![1, 2]);
        assert_eq!(planned[0].event_count(), 5);
        assert_eq!(planned[1].sequences, vec![3]);
    }

    #[test]
    fn test_plan_respects_byte_limit() {
        let one_entry_bytes: usize = entry(1, 10).events.iter().map(encoded_event_size).sum();
        let limits = BatchLimits {
            max_events: 1000,
            max_payload_bytes: envelope_overhead(&envelope()).unwrap() + one_entry_bytes + one_entry_bytes / 2,
        };

        let planned = plan_batches(vec![entry(1, 10), entry(2, 10), entry(3, 10)], &envelope(), limits).unwrap();
        assert_eq!(planned.len(), 3);
        for batch in &planned {
            assert!(batch.body.len() <= limits.max_payload_bytes);
        }
    }

    #[test]
    fn test_long_app_key_stays_within_limit() {
        let envelope = Envelope {
            app_key: "k".repeat(2000),
            device_id: "device".to_string(),
        };
        let limits = BatchLimits {
            max_events: 1000,
            max_payload_bytes: 4096,
        };
        let entries: Vec<_> = (1..=40).map(|sequence| entry(sequence, 1)).collect();

        let planned = plan_batches(entries, &envelope, limits).unwrap();
        assert!(planned.len() > 1);
        for batch in &planned {
            assert!(batch.body.len() <= limits.max_payload_bytes);
        }
        let sent: usize = planned.iter().map(|b| b.event_count()).sum();
        assert_eq!(sent, 40);
    }

    #[test]
    fn test_oversize_entry_sent_alone() {
        let limits = BatchLimits {
            max_events: 2,
            max_payload_bytes: 1 << 20,
        };
        let planned = plan_batches(vec![entry(1, 1), entry(2, 5), entry(3, 1)], &envelope(), limits).unwrap();

        let sequences: Vec<_> = planned.iter().map(|b| b.sequences.clone()).collect();
        assert_eq!(sequences, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_empty_plan() {
        let limits = BatchLimits {
            max_events: 10,
            max_payload_bytes: 4096,
        };
        assert!(plan_batches(vec![], &envelope(), limits).unwrap().is_empty());
    }
}

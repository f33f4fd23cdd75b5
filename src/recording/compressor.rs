// src/recording/compressor.rs
//! zstd codec for spooled batches
//!
//! Spool payloads are JSON arrays of [`EventRecord`]s compressed with zstd.
//! Event batches are repetitive (same keys, same segment names), so even the
//! fast level shrinks them several times over.

use crate::recording::event::EventRecord;
use crate::utils::errors::{AnalyticsError, Result};
use tracing::trace;

/// zstd level 1, cheapest on the recording path
pub const COMPRESSION_LEVEL: i32 = 1;

/// Batch encoder/decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Compressor;

impl Compressor {
    /// Serialize and compress a batch
    pub fn encode_batch(&self, events: &[EventRecord]) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(events)?;
        let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
            .map_err(|e| AnalyticsError::Compression(format!("Compression error: {}", e)))?;

        trace!(
            "Encoded {} events: {} bytes -> {} bytes",
            events.len(),
            json.len(),
            compressed.len()
        );

        Ok(compressed)
    }

    /// Decompress and deserialize a batch
    pub fn decode_batch(&self, payload: &[u8]) -> Result<Vec<EventRecord>> {
        let json = zstd::decode_all(payload)
            .map_err(|e| AnalyticsError::Compression(format!("Decompression error: {}", e)))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

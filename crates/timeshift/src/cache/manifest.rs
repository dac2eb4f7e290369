// Persistent manifest: the serialized index of the segment cache, written
// after every mutation batch and replayed on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed per-segment metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetadata {
    /// Absolute upstream URL the bytes came from.
    pub url: String,
    /// Upstream media-sequence value; primary identity.
    pub sequence_number: u64,
    /// Declared `#EXTINF` duration in seconds.
    pub duration: f64,
    /// Storage id; the stringified sequence number.
    pub segment_id: String,
    /// Wall time the segment entered the cache.
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// `discoveredAt` in epoch milliseconds; the playback-timeline anchor.
    pub timestamp: i64,
    pub metadata: SegmentMetadata,
    pub size: u64,
    pub stored_on_disk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStats {
    pub total_segments: usize,
    pub total_size: u64,
    /// Playable seconds across all segments.
    pub total_duration: f64,
    /// Retention horizon in milliseconds.
    pub buffer_duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Save time in epoch milliseconds.
    pub timestamp: i64,
    pub segments: Vec<ManifestEntry>,
    pub stats: ManifestStats,
}

//! Time-shifted HLS relay engine.
//!
//! Continuously ingests a live HLS audio stream, keeps a multi-hour rolling
//! window of its segments on local storage, and generates playlists that
//! replay the stream at a configurable delay behind live.
//!
//! The pieces compose as a unidirectional chain: the [`monitor`] polls the
//! upstream playlist and publishes discoveries, the [`downloader`] fetches
//! them with bounded concurrency, and the [`cache`] holds the rolling
//! window that the [`generator`] cuts listener playlists from. The
//! [`pipeline`] module wires it all together.

pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod generator;
pub mod monitor;
pub mod pipeline;
pub mod playlist;
pub mod retry;
pub mod store;

pub use cache::{BufferStats, IngestMetadata, RecoveryReport, Segment, SegmentCache};
pub use config::TimeShiftConfig;
pub use downloader::{DownloadOptions, DownloadOutcome, DownloaderStats, SegmentDownloader};
pub use error::{ErrorCategory, Result, TimeShiftError};
pub use events::{EventBus, PipelineEvent};
pub use generator::{GeneratedPlaylist, PlaylistGenerator, PlaylistRequest, UNAVAILABLE_SEGMENT};
pub use monitor::{DiscoveryRecord, MonitorStatus, PlaylistMonitor};
pub use pipeline::{PipelineStatus, TimeShiftPipeline};
pub use playlist::{PlaylistClient, UpstreamPlaylist};
pub use store::DiskStore;

/// Current wall time in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

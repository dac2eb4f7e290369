use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Result, TimeShiftError};

/// Storage layout and write behavior for the disk store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory; segments live under `<base_dir>/segments/`.
    pub base_dir: PathBuf,
    /// When false the cache keeps every segment in memory.
    pub use_disk: bool,
    /// Attempts per segment write before giving up.
    pub max_write_retries: u32,
    /// Fixed delay between write attempts.
    pub write_retry_delay: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data"),
            use_disk: true,
            max_write_retries: 3,
            write_retry_delay: Duration::from_millis(100),
        }
    }
}

/// Rolling-buffer retention settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Retention horizon: segments older than this are evicted.
    pub buffer_duration: Duration,
    /// How often the periodic cleanup runs.
    pub cleanup_interval: Duration,
    /// Duration assumed for orphaned segments adopted during recovery,
    /// when the upstream target duration is not knowable.
    pub target_duration_fallback: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // 8.5 hours: half an hour of slack over the default delay.
            buffer_duration: Duration::from_secs(8 * 3600 + 1800),
            cleanup_interval: Duration::from_secs(60),
            target_duration_fallback: Duration::from_millis(6400),
        }
    }
}

/// Upstream playlist fetch behavior.
#[derive(Debug, Clone)]
pub struct PlaylistConfig {
    pub fetch_timeout: Duration,
    /// Attempts per playlist fetch, at a fixed delay.
    pub fetch_retries: u32,
    pub fetch_retry_delay: Duration,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            fetch_retries: 3,
            fetch_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Poll-loop settings for the upstream monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between playlist polls.
    pub interval: Duration,
    /// Consecutive failed polls before the loop pauses.
    pub max_consecutive_errors: u32,
    /// Pause before the single recovery attempt after hitting the error cap.
    pub retry_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_consecutive_errors: 5,
            retry_delay: Duration::from_secs(30),
        }
    }
}

/// Segment download behavior.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Concurrent download cap.
    pub max_concurrent: usize,
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Base for the exponential backoff schedule.
    pub retry_base_delay: Duration,
    /// Hard cap on any single backoff delay.
    pub max_retry_delay: Duration,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Upper bound on partial bytes retained across a retry for Range resume.
    pub max_range_resume_bytes: usize,
    /// Dedup history is pruned to this many entries.
    pub history_limit: usize,
    /// Queue depth (as a multiple of `max_concurrent`) past which a warning
    /// is logged.
    pub queue_warning_factor: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            max_range_resume_bytes: 4 * 1024 * 1024,
            history_limit: 1000,
            queue_warning_factor: 4,
        }
    }
}

/// Playlist generation settings.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Segments per generated playlist.
    pub window_count: usize,
    /// URL prefix for segment references in rendered playlists.
    pub base_url: String,
    /// `#EXT-X-TARGETDURATION` used when the window is empty.
    pub target_duration_fallback: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            window_count: 5,
            base_url: String::new(),
            target_duration_fallback: 6,
        }
    }
}

/// Top-level configuration for the time-shift pipeline.
#[derive(Debug, Clone)]
pub struct TimeShiftConfig {
    /// Upstream playlist URL (master or media).
    pub upstream_url: String,
    /// How far behind live the relayed stream plays.
    pub delay: Duration,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub playlist: PlaylistConfig,
    pub monitor: MonitorConfig,
    pub downloader: DownloaderConfig,
    pub generator: GeneratorConfig,
}

impl Default for TimeShiftConfig {
    fn default() -> Self {
        Self {
            upstream_url: String::new(),
            delay: Duration::from_secs(8 * 3600),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            playlist: PlaylistConfig::default(),
            monitor: MonitorConfig::default(),
            downloader: DownloaderConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl TimeShiftConfig {
    /// Validate the configuration, failing loudly on anything that would
    /// produce a silently-broken pipeline.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.upstream_url)
            .map_err(|e| TimeShiftError::invalid_url(&self.upstream_url, e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TimeShiftError::invalid_url(
                &self.upstream_url,
                format!("unsupported scheme `{}`", url.scheme()),
            ));
        }
        if self.delay >= self.cache.buffer_duration {
            return Err(TimeShiftError::configuration(format!(
                "delay ({:?}) must be shorter than the buffer duration ({:?})",
                self.delay, self.cache.buffer_duration
            )));
        }
        if self.monitor.interval.is_zero() {
            return Err(TimeShiftError::configuration(
                "monitor interval must be positive",
            ));
        }
        if self.downloader.max_concurrent == 0 {
            return Err(TimeShiftError::configuration(
                "max_concurrent must be at least 1",
            ));
        }
        if self.generator.window_count == 0 {
            return Err(TimeShiftError::configuration(
                "window_count must be at least 1",
            ));
        }
        Ok(())
    }

    /// The parsed upstream URL. Call after `validate`.
    pub fn upstream(&self) -> Result<Url> {
        Url::parse(&self.upstream_url)
            .map_err(|e| TimeShiftError::invalid_url(&self.upstream_url, e.to_string()))
    }
}

// Pipeline supervisor: composes store, cache, monitor, downloader, and
// generator, and owns their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{BufferStats, IngestMetadata, RecoveryReport, SegmentCache};
use crate::config::TimeShiftConfig;
use crate::downloader::{DownloadOptions, DownloaderStats, SegmentDownloader};
use crate::error::{Result, TimeShiftError};
use crate::events::EventBus;
use crate::generator::PlaylistGenerator;
use crate::monitor::{DiscoveryRecord, MonitorStatus, PlaylistMonitor};
use crate::now_ms;
use crate::playlist::PlaylistClient;
use crate::store::DiskStore;

const DISCOVERY_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    /// True once the oldest cached segment is at least `delay` old, i.e.
    /// listeners tuning in will hear real content.
    pub buffer_ready: bool,
    pub seconds_until_ready: f64,
    pub monitor: MonitorStatus,
    pub downloader: DownloaderStats,
    pub cache: BufferStats,
}

struct RunState {
    token: CancellationToken,
    wiring: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

/// Composition root for the time-shift pipeline.
///
/// Event flow is a unidirectional chain wired here: the monitor publishes
/// discoveries into an mpsc channel, a wiring task hands them to the
/// downloader, and the downloader deposits bytes into the cache.
pub struct TimeShiftPipeline {
    config: TimeShiftConfig,
    cache: Arc<SegmentCache>,
    downloader: Arc<SegmentDownloader>,
    monitor: Arc<PlaylistMonitor>,
    generator: Arc<PlaylistGenerator>,
    playlist_client: Arc<PlaylistClient>,
    events: Arc<EventBus>,
    recovery: RecoveryReport,
    run: parking_lot::Mutex<Option<RunState>>,
    /// Serializes start/stop transitions.
    lifecycle: tokio::sync::Mutex<()>,
}

impl TimeShiftPipeline {
    /// Validate the configuration, initialize storage, and recover the
    /// cache. The monitor is constructed but not started.
    pub async fn init(config: TimeShiftConfig) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let store = Arc::new(DiskStore::init(&config.storage).await?);
        let cache = Arc::new(SegmentCache::new(
            store,
            &config.cache,
            config.storage.use_disk,
            events.clone(),
        ));
        let recovery = cache.recover().await?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("timeshift-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let playlist_client = Arc::new(PlaylistClient::new(client.clone(), config.playlist.clone()));
        let downloader = Arc::new(SegmentDownloader::new(
            client,
            config.downloader.clone(),
            cache.clone(),
            events.clone(),
        ));
        let monitor = Arc::new(PlaylistMonitor::new(
            playlist_client.clone(),
            config.monitor.clone(),
            config.cache.buffer_duration.as_millis() as i64,
            events.clone(),
        ));
        let generator = Arc::new(PlaylistGenerator::new(
            cache.clone(),
            config.generator.clone(),
            config.delay,
        ));

        info!(
            upstream = %config.upstream_url,
            delay_s = config.delay.as_secs(),
            buffer_s = config.cache.buffer_duration.as_secs(),
            "Pipeline initialized"
        );
        Ok(Self {
            config,
            cache,
            downloader,
            monitor,
            generator,
            playlist_client,
            events,
            recovery,
            run: parking_lot::Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub fn generator(&self) -> &Arc<PlaylistGenerator> {
        &self.generator
    }

    pub fn downloader(&self) -> &Arc<SegmentDownloader> {
        &self.downloader
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    /// Resolve the upstream URL to a media playlist URL: a media playlist
    /// passes through, a master playlist yields its first variant.
    async fn resolve_media_url(&self, token: &CancellationToken) -> Result<Url> {
        let upstream = self.config.upstream()?;
        let playlist = self.playlist_client.fetch_playlist(&upstream, token).await?;
        if !playlist.is_master() {
            return Ok(upstream);
        }
        let urls = PlaylistClient::segment_urls(&playlist, &upstream);
        let media_url = urls
            .into_iter()
            .next()
            .ok_or_else(|| TimeShiftError::playlist("master playlist has no variants"))?;
        info!(master = %upstream, media = %media_url, "Resolved master playlist to first variant");
        Ok(media_url)
    }

    /// Start monitoring and downloading. Returns `Ok(false)` when already
    /// running. With `immediate`, the first poll happens right away.
    pub async fn start(&self, immediate: bool) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.run.lock().is_some() {
            debug!("Start ignored; pipeline already running");
            return Ok(false);
        }

        let token = CancellationToken::new();
        let media_url = self.resolve_media_url(&token).await?;

        let (tx, rx) = mpsc::channel::<DiscoveryRecord>(DISCOVERY_CHANNEL_CAPACITY);
        let wiring = tokio::spawn(Self::wire_discoveries(
            rx,
            self.downloader.clone(),
            token.clone(),
        ));
        let cleanup = tokio::spawn(Self::cleanup_loop(
            self.cache.clone(),
            self.config.cache.cleanup_interval,
            token.clone(),
        ));
        self.monitor
            .start(media_url, immediate, tx, token.clone());

        *self.run.lock() = Some(RunState {
            token,
            wiring,
            cleanup,
        });
        info!("Pipeline started");
        Ok(true)
    }

    /// Periodic eviction, bounding how far past the retention horizon the
    /// oldest segment can drift between ingests.
    async fn cleanup_loop(cache: Arc<SegmentCache>, interval: Duration, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let evicted = cache.prune().await;
            if evicted > 0 {
                debug!(evicted, "Periodic cleanup evicted segments");
            }
        }
    }

    /// Feed monitor discoveries to the downloader. Each discovery runs as
    /// its own task; the downloader's semaphore enforces the concurrency
    /// cap and its counters track the backlog.
    async fn wire_discoveries(
        mut rx: mpsc::Receiver<DiscoveryRecord>,
        downloader: Arc<SegmentDownloader>,
        token: CancellationToken,
    ) {
        loop {
            let record = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                record = rx.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };
            let downloader = downloader.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let meta = IngestMetadata {
                    url: record.url.to_string(),
                    sequence_number: Some(record.sequence_number),
                    duration: record.duration,
                };
                // A terminal failure is not re-queued; the monitor still
                // holds this URL in its known set and will not re-publish.
                if let Err(e) = downloader
                    .download(&record.url, meta, DownloadOptions::default(), &token)
                    .await
                {
                    debug!(url = %record.url, error = %e, "Segment abandoned");
                }
            });
        }
        debug!("Discovery wiring task exited");
    }

    /// Stop the monitor, drain in-flight downloads up to `deadline`, and
    /// persist the manifest. Returns false when not running.
    pub async fn stop(&self, deadline: Duration) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(run) = self.run.lock().take() else {
            debug!("Stop ignored; pipeline not running");
            return false;
        };

        run.token.cancel();
        if !self.monitor.join(Duration::from_secs(1)).await {
            warn!("Monitor did not exit in time");
        }
        if !self.downloader.finish_pending(deadline).await {
            warn!(
                deadline_ms = deadline.as_millis() as u64,
                "Downloads still pending at shutdown deadline"
            );
        }
        if tokio::time::timeout(Duration::from_secs(1), run.wiring)
            .await
            .is_err()
        {
            warn!("Discovery wiring task did not exit in time");
        }
        run.cleanup.abort();
        self.cache.write_manifest_now().await;
        info!("Pipeline stopped");
        true
    }

    pub fn status(&self) -> PipelineStatus {
        let cache_stats = self.cache.stats();
        let delay_ms = self.config.delay.as_millis() as i64;
        let (buffer_ready, seconds_until_ready) = match cache_stats.oldest_discovered_at {
            Some(oldest) => {
                let age_ms = now_ms() - oldest;
                (
                    age_ms >= delay_ms,
                    ((delay_ms - age_ms).max(0) as f64) / 1000.0,
                )
            }
            None => (delay_ms == 0, delay_ms as f64 / 1000.0),
        };

        PipelineStatus {
            running: self.is_running(),
            buffer_ready,
            seconds_until_ready,
            monitor: self.monitor.status(),
            downloader: self.downloader.stats(),
            cache: cache_stats,
        }
    }
}

// Upstream monitor: polls one media playlist on an interval and publishes
// newly discovered segments to the download pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MonitorConfig;
use crate::events::{EventBus, PipelineEvent};
use crate::now_ms;
use crate::playlist::{PlaylistClient, PlaylistKind};

/// Message published for every segment the monitor has not seen before.
#[derive(Debug, Clone)]
pub struct DiscoveryRecord {
    pub sequence_number: u64,
    pub url: Url,
    pub duration: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub known_urls: usize,
    pub last_sequence: Option<u64>,
    pub consecutive_errors: u32,
    pub last_poll_at: Option<i64>,
    pub polls: u64,
    pub discovered: u64,
}

#[derive(Default)]
struct MonitorState {
    /// URL -> wall time first seen; pruned to the cache's retention horizon
    /// so the set stays bounded.
    known: HashMap<String, i64>,
    last_sequence: Option<u64>,
    consecutive_errors: u32,
    last_poll_at: Option<i64>,
    polls: u64,
    discovered: u64,
}

/// Polls the upstream media playlist and emits [`DiscoveryRecord`]s.
///
/// Within a single poll, discoveries are published in ascending sequence
/// order. After `max_consecutive_errors` failed polls the loop pauses,
/// emits [`PipelineEvent::MonitorPaused`], and makes a single recovery
/// attempt after `retry_delay`.
pub struct PlaylistMonitor {
    client: Arc<PlaylistClient>,
    config: MonitorConfig,
    /// Known-set retention horizon, mirroring the cache's buffer duration.
    retention_ms: i64,
    events: Arc<EventBus>,
    state: Mutex<MonitorState>,
    running: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PlaylistMonitor {
    pub fn new(
        client: Arc<PlaylistClient>,
        config: MonitorConfig,
        retention_ms: i64,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            client,
            config,
            retention_ms,
            events,
            state: Mutex::new(MonitorState::default()),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.state.lock();
        MonitorStatus {
            running: self.is_running(),
            known_urls: state.known.len(),
            last_sequence: state.last_sequence,
            consecutive_errors: state.consecutive_errors,
            last_poll_at: state.last_poll_at,
            polls: state.polls,
            discovered: state.discovered,
        }
    }

    /// Begin the poll loop against `media_url`. Idempotent: returns false
    /// if the loop is already running. When `immediate` is false the first
    /// poll waits one full interval.
    pub fn start(
        self: &Arc<Self>,
        media_url: Url,
        immediate: bool,
        tx: mpsc::Sender<DiscoveryRecord>,
        token: CancellationToken,
    ) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Monitor already running");
            return false;
        }
        info!(url = %media_url, interval_ms = self.config.interval.as_millis() as u64, "Monitor starting");
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            monitor.run_loop(media_url, immediate, tx, token).await;
            monitor.running.store(false, Ordering::SeqCst);
            info!("Monitor stopped");
        });
        *self.task.lock() = Some(handle);
        true
    }

    /// Wait for the poll loop to wind down after its token was cancelled.
    /// Returns false when it did not exit within `timeout`.
    pub async fn join(&self, timeout: std::time::Duration) -> bool {
        let handle = self.task.lock().take();
        match handle {
            Some(handle) => tokio::time::timeout(timeout, handle).await.is_ok(),
            None => true,
        }
    }

    async fn run_loop(
        &self,
        media_url: Url,
        immediate: bool,
        tx: mpsc::Sender<DiscoveryRecord>,
        token: CancellationToken,
    ) {
        let mut first = true;
        loop {
            if !(first && immediate) {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
            first = false;

            match self.poll_once(&media_url, &tx, &token).await {
                Ok(new_segments) => {
                    self.state.lock().consecutive_errors = 0;
                    if new_segments > 0 {
                        debug!(new_segments, "Poll discovered segments");
                    }
                }
                Err(PollFailure::ChannelClosed) => {
                    warn!("Discovery channel closed; monitor exiting");
                    return;
                }
                Err(PollFailure::Cancelled) => return,
                Err(PollFailure::Upstream(e)) => {
                    let errors = {
                        let mut state = self.state.lock();
                        state.consecutive_errors += 1;
                        state.consecutive_errors
                    };
                    warn!(
                        consecutive_errors = errors,
                        max = self.config.max_consecutive_errors,
                        error = %e,
                        "Playlist poll failed"
                    );
                    if errors >= self.config.max_consecutive_errors {
                        self.events.emit(PipelineEvent::MonitorPaused {
                            consecutive_errors: errors,
                        });
                        warn!(
                            retry_delay_ms = self.config.retry_delay.as_millis() as u64,
                            "Error cap reached; pausing before recovery attempt"
                        );
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(self.config.retry_delay) => {}
                        }
                        self.state.lock().consecutive_errors = 0;
                    }
                }
            }
        }
    }

    /// One poll: fetch, parse, publish unseen segments in playlist order.
    async fn poll_once(
        &self,
        media_url: &Url,
        tx: &mpsc::Sender<DiscoveryRecord>,
        token: &CancellationToken,
    ) -> std::result::Result<usize, PollFailure> {
        let now = now_ms();
        {
            let mut state = self.state.lock();
            state.polls += 1;
            state.last_poll_at = Some(now);
        }

        let playlist = self
            .client
            .fetch_playlist(media_url, token)
            .await
            .map_err(|e| match e {
                crate::error::TimeShiftError::Cancelled => PollFailure::Cancelled,
                other => PollFailure::Upstream(other),
            })?;
        if playlist.kind != PlaylistKind::Media {
            return Err(PollFailure::Upstream(crate::error::TimeShiftError::playlist(
                "expected a media playlist, got a master playlist",
            )));
        }

        let fresh = self.collect_unseen(&playlist, media_url, now);

        let mut published = 0usize;
        for record in fresh {
            let key = record.url.to_string();
            if tx.send(record.clone()).await.is_err() {
                return Err(PollFailure::ChannelClosed);
            }
            self.events.emit(PipelineEvent::SegmentDiscovered {
                sequence: record.sequence_number,
                url: key.clone(),
                duration: record.duration,
            });
            let mut state = self.state.lock();
            state.known.insert(key, now);
            state.discovered += 1;
            let last = state.last_sequence.unwrap_or(0);
            state.last_sequence = Some(last.max(record.sequence_number));
            published += 1;
        }
        Ok(published)
    }

    /// Compute the unseen segments of a poll, in ascending sequence order,
    /// and surface upstream discontinuities. Also prunes the known set.
    fn collect_unseen(
        &self,
        playlist: &crate::playlist::UpstreamPlaylist,
        media_url: &Url,
        now: i64,
    ) -> Vec<DiscoveryRecord> {
        let mut state = self.state.lock();

        state.known.retain(|_, seen| now - *seen <= self.retention_ms);

        if let Some(last) = state.last_sequence
            && playlist.media_sequence > last + 1
        {
            let expected = last + 1;
            let actual = playlist.media_sequence;
            warn!(
                expected,
                actual,
                skipped = actual - expected,
                "Upstream sequence discontinuity"
            );
            self.events.emit(PipelineEvent::Discontinuity {
                expected,
                actual,
                skipped: actual - expected,
            });
        }

        playlist
            .segments
            .iter()
            .enumerate()
            .filter_map(|(index, segment)| {
                let url = crate::playlist::resolve_uri(media_url, &segment.uri).ok()?;
                if state.known.contains_key(url.as_str()) {
                    return None;
                }
                Some(DiscoveryRecord {
                    sequence_number: playlist.media_sequence + index as u64,
                    url,
                    duration: segment.duration,
                })
            })
            .collect()
    }

    /// Drop the known set and sequence tracking. Intended for tests and for
    /// operators forcing a full re-scan.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.known.clear();
        state.last_sequence = None;
        state.consecutive_errors = 0;
    }
}

enum PollFailure {
    Upstream(crate::error::TimeShiftError),
    Cancelled,
    ChannelClosed,
}

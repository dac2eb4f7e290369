// Segment downloader: bounded-parallelism fetcher with categorized retries,
// Range-based resume of partial bodies, and a URL dedup history.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{IngestMetadata, SegmentCache};
use crate::config::DownloaderConfig;
use crate::error::{
    ErrorCategory, Result, TimeShiftError, categorize_reqwest, categorize_status,
    is_retryable_reqwest_error, is_retryable_status,
};
use crate::events::{EventBus, PipelineEvent};
use crate::now_ms;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    /// Bypass the dedup history and fetch even for a known URL.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub url: String,
    pub sequence_number: Option<u64>,
    pub bytes: u64,
    pub duration_ms: u64,
    pub bandwidth_kbps: f64,
    /// True when the result was answered from the dedup history.
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    size: u64,
    duration_ms: u64,
    bandwidth_kbps: f64,
    timestamp: i64,
}

#[derive(Default)]
struct History {
    map: HashMap<String, HistoryEntry>,
    order: VecDeque<String>,
}

#[derive(Default)]
struct StatsInner {
    total_downloads: u64,
    total_bytes: u64,
    dedup_hits: u64,
    failures: HashMap<ErrorCategory, u64>,
    /// Rolling window of (duration_ms, bandwidth_kbps) samples.
    recent: VecDeque<(u64, f64)>,
}

const ROLLING_WINDOW: usize = 50;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloaderStats {
    pub total_downloads: u64,
    pub total_bytes: u64,
    pub dedup_hits: u64,
    pub failures: HashMap<&'static str, u64>,
    pub avg_download_ms: f64,
    pub avg_bandwidth_kbps: f64,
    pub active: usize,
    pub queued: usize,
}

/// Concurrent segment fetcher feeding the cache.
///
/// Submissions beyond `max_concurrent` queue on the internal semaphore in
/// FIFO order; the cache tolerates out-of-order arrival.
pub struct SegmentDownloader {
    client: reqwest::Client,
    config: DownloaderConfig,
    cache: Arc<SegmentCache>,
    events: Arc<EventBus>,
    semaphore: Arc<Semaphore>,
    history: Mutex<History>,
    stats: Mutex<StatsInner>,
    active: AtomicUsize,
    queued: AtomicUsize,
    idle: Notify,
}

impl SegmentDownloader {
    pub fn new(
        client: reqwest::Client,
        config: DownloaderConfig,
        cache: Arc<SegmentCache>,
        events: Arc<EventBus>,
    ) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            client,
            config,
            cache,
            events,
            semaphore: Arc::new(Semaphore::new(permits)),
            history: Mutex::new(History::default()),
            stats: Mutex::new(StatsInner::default()),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn in_flight(&self) -> usize {
        self.active.load(Ordering::SeqCst) + self.queued.load(Ordering::SeqCst)
    }

    fn settle(&self) {
        if self.in_flight() == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Fetch one URL and deposit the bytes into the cache.
    ///
    /// Unless `opts.force` is set, a URL already in the dedup history
    /// resolves immediately with `from_cache = true`.
    pub async fn download(
        &self,
        url: &Url,
        meta: IngestMetadata,
        opts: DownloadOptions,
        token: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let key = url.to_string();

        if !opts.force
            && let Some(entry) = self.history.lock().map.get(&key).cloned()
        {
            trace!(url = %url, age_ms = now_ms() - entry.timestamp, "Dedup history hit");
            self.stats.lock().dedup_hits += 1;
            return Ok(DownloadOutcome {
                url: key,
                sequence_number: meta.sequence_number,
                bytes: entry.size,
                duration_ms: entry.duration_ms,
                bandwidth_kbps: entry.bandwidth_kbps,
                from_cache: true,
            });
        }

        let queued_now = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
        let threshold = self.config.max_concurrent * self.config.queue_warning_factor;
        if queued_now > threshold {
            warn!(
                queued = queued_now,
                threshold, "Download queue depth above sanity threshold"
            );
        }

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.settle();
                return Err(TimeShiftError::Cancelled);
            }
            permit = self.semaphore.acquire() => permit,
        };
        // Semaphore is never closed while the downloader is alive.
        let _permit = permit.map_err(|_| TimeShiftError::Cancelled)?;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);

        let started = Instant::now();
        let result = self.fetch_with_retries(url, token).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.settle();

        match result {
            Ok(bytes) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let size = bytes.len() as u64;
                let bandwidth_kbps = if duration_ms > 0 {
                    (size as f64 * 8.0) / duration_ms as f64
                } else {
                    0.0
                };

                let sequence_number = meta.sequence_number;
                let added = self.cache.add(bytes, meta).await?;

                self.record_success(&key, size, duration_ms, bandwidth_kbps);
                debug!(
                    url = %url,
                    sequence = added.sequence_number,
                    bytes = size,
                    duration_ms,
                    "Segment downloaded"
                );
                self.events.emit(PipelineEvent::DownloadSucceeded {
                    url: key.clone(),
                    sequence: sequence_number,
                    bytes: size,
                    duration_ms,
                });

                Ok(DownloadOutcome {
                    url: key,
                    sequence_number: Some(added.sequence_number),
                    bytes: size,
                    duration_ms,
                    bandwidth_kbps,
                    from_cache: false,
                })
            }
            Err(TimeShiftError::Cancelled) => Err(TimeShiftError::Cancelled),
            Err(e) => {
                let category = e.category();
                self.record_failure(category);
                self.events.emit(PipelineEvent::DownloadFailed {
                    url: key,
                    category,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Download a batch, waiting for all of them. Concurrency is bounded by
    /// the shared semaphore.
    pub async fn download_many(
        &self,
        jobs: Vec<(Url, IngestMetadata)>,
        opts: DownloadOptions,
        token: &CancellationToken,
    ) -> Vec<Result<DownloadOutcome>> {
        futures::future::join_all(
            jobs.iter()
                .map(|(url, meta)| self.download(url, meta.clone(), opts, token)),
        )
        .await
    }

    /// Wait for all queued and in-flight downloads, up to `timeout`.
    /// Returns true when the pipeline drained in time.
    pub async fn finish_pending(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    pub fn stats(&self) -> DownloaderStats {
        let stats = self.stats.lock();
        let samples = stats.recent.len().max(1) as f64;
        DownloaderStats {
            total_downloads: stats.total_downloads,
            total_bytes: stats.total_bytes,
            dedup_hits: stats.dedup_hits,
            failures: stats
                .failures
                .iter()
                .map(|(category, count)| (category.as_str(), *count))
                .collect(),
            avg_download_ms: stats.recent.iter().map(|(ms, _)| *ms as f64).sum::<f64>() / samples,
            avg_bandwidth_kbps: stats.recent.iter().map(|(_, kbps)| *kbps).sum::<f64>() / samples,
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }

    /// Wipe the dedup history (tests, or an operator forcing re-fetch).
    pub fn clear_history(&self) {
        let mut history = self.history.lock();
        history.map.clear();
        history.order.clear();
    }

    fn record_success(&self, key: &str, size: u64, duration_ms: u64, bandwidth_kbps: f64) {
        {
            let mut history = self.history.lock();
            if history.map.insert(
                key.to_string(),
                HistoryEntry {
                    size,
                    duration_ms,
                    bandwidth_kbps,
                    timestamp: now_ms(),
                },
            ).is_none()
            {
                history.order.push_back(key.to_string());
            }
            while history.order.len() > self.config.history_limit {
                if let Some(evicted) = history.order.pop_front() {
                    history.map.remove(&evicted);
                }
            }
        }
        let mut stats = self.stats.lock();
        stats.total_downloads += 1;
        stats.total_bytes += size;
        stats.recent.push_back((duration_ms, bandwidth_kbps));
        while stats.recent.len() > ROLLING_WINDOW {
            stats.recent.pop_front();
        }
    }

    fn record_failure(&self, category: ErrorCategory) {
        *self.stats.lock().failures.entry(category).or_insert(0) += 1;
    }

    /// Fetch with the exponential-backoff schedule, carrying partial bytes
    /// across attempts for Range resume.
    async fn fetch_with_retries(&self, url: &Url, token: &CancellationToken) -> Result<Bytes> {
        let policy = RetryPolicy {
            max_retries: self.config.max_retries,
            base_delay: self.config.retry_base_delay,
            max_delay: self.config.max_retry_delay,
            jitter: true,
        };
        let mut partial = BytesMut::new();
        let mut attempt = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(TimeShiftError::Cancelled);
            }

            let err = match self.attempt_fetch(url, &mut partial, token).await {
                AttemptOutcome::Done(bytes) => return Ok(bytes),
                AttemptOutcome::Fail(err) => return Err(err),
                AttemptOutcome::Retry(err) => err,
            };

            if attempt >= policy.max_retries {
                return Err(err);
            }
            let delay = policy.delay_for_attempt(attempt);
            warn!(
                url = %url,
                attempt = attempt + 1,
                max = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                resume_from = partial.len(),
                error = %err,
                "Retrying segment download"
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TimeShiftError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// One request. `partial` carries bytes accumulated by earlier attempts;
    /// when non-empty the request asks for `Range: bytes=<len>-` and a 206
    /// response appends to it, while a 200 replaces it.
    async fn attempt_fetch(
        &self,
        url: &Url,
        partial: &mut BytesMut,
        token: &CancellationToken,
    ) -> AttemptOutcome {
        let resume_from = partial.len();
        let mut request = self
            .client
            .get(url.clone())
            .timeout(self.config.request_timeout);
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return AttemptOutcome::Fail(TimeShiftError::Cancelled),
            response = request.send() => response,
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let category = categorize_reqwest(&e);
                let err =
                    TimeShiftError::segment_fetch(format!("request to {url} failed: {e}"), category);
                return if is_retryable_reqwest_error(&e) {
                    AttemptOutcome::Retry(err)
                } else {
                    AttemptOutcome::Fail(err)
                };
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::PARTIAL_CONTENT && resume_from > 0 {
            trace!(url = %url, resume_from, "Resuming from partial content");
        } else if status.is_success() {
            // Full body; the server ignored the range request, if any.
            partial.clear();
        } else {
            let err = TimeShiftError::segment_fetch(
                format!("HTTP {status} for {url}"),
                categorize_status(status),
            );
            return if is_retryable_status(status) {
                AttemptOutcome::Retry(err)
            } else {
                AttemptOutcome::Fail(err)
            };
        }

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return AttemptOutcome::Fail(TimeShiftError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => partial.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    // Keep the partial body for resume unless it exceeds the
                    // retention bound.
                    if partial.len() > self.config.max_range_resume_bytes {
                        partial.clear();
                    }
                    let category = categorize_reqwest(&e);
                    return AttemptOutcome::Retry(TimeShiftError::segment_fetch(
                        format!("body read from {url} failed: {e}"),
                        category,
                    ));
                }
                None => break,
            }
        }

        if partial.is_empty() {
            return AttemptOutcome::Fail(TimeShiftError::segment_fetch(
                format!("empty body from {url}"),
                ErrorCategory::Content,
            ));
        }
        AttemptOutcome::Done(partial.split().freeze())
    }
}

enum AttemptOutcome {
    Done(Bytes),
    Retry(TimeShiftError),
    Fail(TimeShiftError),
}

// Segment cache: a hybrid rolling buffer. The metadata index lives in
// memory and is authoritative; segment bytes live on disk (preferred) or in
// memory when a disk write failed. Eviction is strictly by discovery time.

mod manifest;

pub use manifest::{Manifest, ManifestEntry, ManifestStats, SegmentMetadata};

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::events::{EventBus, PipelineEvent};
use crate::now_ms;
use crate::store::DiskStore;

/// Ingest-side metadata handed to [`SegmentCache::add`] by the downloader.
#[derive(Debug, Clone)]
pub struct IngestMetadata {
    pub url: String,
    /// Absent when the upstream playlist carried no usable sequence; the
    /// cache synthesizes an id in that case.
    pub sequence_number: Option<u64>,
    pub duration: f64,
}

#[derive(Debug, Clone)]
enum SegmentBytes {
    /// Bytes live under `segments/<id>.ts`.
    Disk,
    /// Disk write failed (or disk is disabled); bytes retained in memory.
    Memory(Bytes),
}

#[derive(Debug, Clone)]
struct SegmentRecord {
    meta: SegmentMetadata,
    discovered_at: i64,
    size: u64,
    bytes: SegmentBytes,
}

/// A segment as seen by callers: metadata always, bytes on request.
#[derive(Debug, Clone)]
pub struct Segment {
    pub metadata: SegmentMetadata,
    pub discovered_at: i64,
    pub size: u64,
    pub on_disk: bool,
    /// `None` when bytes were not requested, or when an indexed segment's
    /// disk read failed (callers treat that as transient).
    pub bytes: Option<Bytes>,
}

impl SegmentRecord {
    fn to_segment(&self, bytes: Option<Bytes>) -> Segment {
        Segment {
            metadata: self.meta.clone(),
            discovered_at: self.discovered_at,
            size: self.size,
            on_disk: matches!(self.bytes, SegmentBytes::Disk),
            bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AddOutcome {
    pub sequence_number: u64,
    pub size: u64,
    pub on_disk: bool,
    /// True when the sequence was already cached and the new bytes were
    /// dropped (idempotent ingest).
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    pub segment_count: usize,
    pub total_bytes: u64,
    pub total_duration_secs: f64,
    pub oldest_discovered_at: Option<i64>,
    pub newest_discovered_at: Option<i64>,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    /// Adjacent pairs in the sequence-sorted view differing by more than 1.
    pub sequence_gaps: usize,
    pub memory_segments: usize,
    pub buffer_duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Manifest entries whose blob was present.
    pub restored: usize,
    /// On-disk blobs adopted without a manifest entry.
    pub adopted: usize,
    /// Manifest entries dropped because their blob was gone.
    pub dropped: usize,
    /// Unparseable orphan files deleted during reconciliation.
    pub deleted: usize,
    /// Segments evicted immediately because they fell outside the window.
    pub pruned: usize,
}

#[derive(Default)]
struct CacheInner {
    by_sequence: BTreeMap<u64, SegmentRecord>,
    /// Ordering index keyed by (discovered_at, sequence); the composite key
    /// keeps ms-precision timestamp collisions from shadowing each other.
    by_time: BTreeMap<(i64, u64), u64>,
    total_bytes: u64,
    total_duration: f64,
}

impl CacheInner {
    fn insert(&mut self, record: SegmentRecord) {
        let seq = record.meta.sequence_number;
        self.total_bytes += record.size;
        self.total_duration += record.meta.duration;
        self.by_time.insert((record.discovered_at, seq), seq);
        self.by_sequence.insert(seq, record);
    }

    fn remove(&mut self, seq: u64) -> Option<SegmentRecord> {
        let record = self.by_sequence.remove(&seq)?;
        self.by_time.remove(&(record.discovered_at, seq));
        self.total_bytes = self.total_bytes.saturating_sub(record.size);
        self.total_duration = (self.total_duration - record.meta.duration).max(0.0);
        Some(record)
    }
}

/// The rolling segment buffer.
///
/// Readers take a shared lock over the in-memory index; disk reads happen
/// after the lock is released. Mutations (`add`, `prune`, `clear`,
/// `recover`) are serialized by a single async mutex so disk writes never
/// run under the index lock.
pub struct SegmentCache {
    store: Arc<DiskStore>,
    events: Arc<EventBus>,
    buffer_duration_ms: i64,
    target_duration_fallback: Duration,
    disk_enabled: bool,
    inner: RwLock<CacheInner>,
    mutate: tokio::sync::Mutex<()>,
}

impl SegmentCache {
    pub fn new(
        store: Arc<DiskStore>,
        config: &CacheConfig,
        disk_enabled: bool,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            events,
            buffer_duration_ms: config.buffer_duration.as_millis() as i64,
            target_duration_fallback: config.target_duration_fallback,
            disk_enabled,
            inner: RwLock::new(CacheInner::default()),
            mutate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn disk_enabled(&self) -> bool {
        self.disk_enabled
    }

    pub fn buffer_duration_ms(&self) -> i64 {
        self.buffer_duration_ms
    }

    /// Ingest a segment at the current wall time.
    pub async fn add(&self, bytes: Bytes, meta: IngestMetadata) -> Result<AddOutcome> {
        self.add_at(now_ms(), bytes, meta).await
    }

    /// Ingest a segment with an explicit discovery timestamp. Used by
    /// recovery adoption and by tests; `add` is the wall-clock wrapper.
    pub async fn add_at(
        &self,
        discovered_at: i64,
        bytes: Bytes,
        meta: IngestMetadata,
    ) -> Result<AddOutcome> {
        let _guard = self.mutate.lock().await;

        let seq = meta
            .sequence_number
            .unwrap_or_else(|| synthesize_sequence(&meta.url, discovered_at));

        // Duplicate sequence: drop the new bytes, keep the first write.
        if let Some(existing) = self.inner.read().by_sequence.get(&seq) {
            debug!(sequence = seq, "Duplicate segment ignored");
            return Ok(AddOutcome {
                sequence_number: seq,
                size: existing.size,
                on_disk: matches!(existing.bytes, SegmentBytes::Disk),
                deduplicated: true,
            });
        }

        let segment_id = seq.to_string();
        let size = bytes.len() as u64;

        let stored = if self.disk_enabled {
            match self.store.write_segment(&segment_id, &bytes).await {
                Ok(_) => SegmentBytes::Disk,
                Err(e) => {
                    warn!(
                        sequence = seq,
                        error = %e,
                        "Disk write failed; retaining segment in memory"
                    );
                    SegmentBytes::Memory(bytes)
                }
            }
        } else {
            SegmentBytes::Memory(bytes)
        };
        let on_disk = matches!(stored, SegmentBytes::Disk);

        let record = SegmentRecord {
            meta: SegmentMetadata {
                url: meta.url,
                sequence_number: seq,
                duration: meta.duration,
                segment_id,
                added_at: Utc
                    .timestamp_millis_opt(discovered_at)
                    .single()
                    .unwrap_or_else(Utc::now),
            },
            discovered_at,
            size,
            bytes: stored,
        };

        self.inner.write().insert(record);

        let expired = self.evict_expired(discovered_at).await;
        self.write_manifest_snapshot(discovered_at).await;
        drop(_guard);

        self.events.emit(PipelineEvent::SegmentAdded {
            sequence: seq,
            size,
        });
        for sequence in expired {
            self.events.emit(PipelineEvent::SegmentExpired { sequence });
        }

        Ok(AddOutcome {
            sequence_number: seq,
            size,
            on_disk,
            deduplicated: false,
        })
    }

    /// Metadata plus bytes for one sequence. Bytes are read from disk on
    /// demand; a failed read leaves `bytes` as `None` and does not evict.
    pub async fn get_by_sequence(&self, seq: u64) -> Option<Segment> {
        let record = self.inner.read().by_sequence.get(&seq).cloned()?;
        let bytes = match &record.bytes {
            SegmentBytes::Memory(b) => Some(b.clone()),
            SegmentBytes::Disk => {
                match self.store.read_segment(&record.meta.segment_id).await {
                    Ok(Some(b)) => Some(b),
                    Ok(None) => {
                        warn!(sequence = seq, "Indexed segment missing on disk");
                        None
                    }
                    Err(e) => {
                        warn!(sequence = seq, error = %e, "Segment read failed");
                        None
                    }
                }
            }
        };
        Some(record.to_segment(bytes))
    }

    /// Metadata only; no disk access.
    pub fn get_meta(&self, seq: u64) -> Option<Segment> {
        self.inner
            .read()
            .by_sequence
            .get(&seq)
            .map(|r| r.to_segment(None))
    }

    pub fn contains_sequence(&self, seq: u64) -> bool {
        self.inner.read().by_sequence.contains_key(&seq)
    }

    /// The segment whose `discovered_at` is nearest to `target`.
    ///
    /// Before the oldest entry the oldest is returned; past the newest, the
    /// newest. Ties between the bracketing entries go to the earlier one.
    /// Empty cache returns `None`.
    pub fn get_at(&self, target: i64) -> Option<Segment> {
        let inner = self.inner.read();
        let below = inner
            .by_time
            .range(..=(target, u64::MAX))
            .next_back()
            .map(|(&(ts, _), &seq)| (ts, seq));
        let above = inner
            .by_time
            .range((Bound::Excluded((target, u64::MAX)), Bound::Unbounded))
            .next()
            .map(|(&(ts, _), &seq)| (ts, seq));

        let seq = match (below, above) {
            (None, None) => return None,
            (Some((_, seq)), None) | (None, Some((_, seq))) => seq,
            (Some((below_ts, below_seq)), Some((above_ts, above_seq))) => {
                if target - below_ts <= above_ts - target {
                    below_seq
                } else {
                    above_seq
                }
            }
        };
        inner.by_sequence.get(&seq).map(|r| r.to_segment(None))
    }

    /// All segments with `start <= discovered_at <= end`, ascending by
    /// discovery time. The range is clamped to the cache's extent; a
    /// disjoint range yields an empty vec.
    pub fn get_range(&self, start: i64, end: i64) -> Vec<Segment> {
        if start > end {
            return Vec::new();
        }
        let inner = self.inner.read();
        inner
            .by_time
            .range((
                Bound::Included((start, u64::MIN)),
                Bound::Included((end, u64::MAX)),
            ))
            .filter_map(|(_, seq)| inner.by_sequence.get(seq))
            .map(|r| r.to_segment(None))
            .collect()
    }

    pub fn oldest_time(&self) -> Option<i64> {
        self.inner.read().by_time.keys().next().map(|&(ts, _)| ts)
    }

    pub fn newest_time(&self) -> Option<i64> {
        self.inner
            .read()
            .by_time
            .keys()
            .next_back()
            .map(|&(ts, _)| ts)
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.read();
        let sequence_gaps = inner
            .by_sequence
            .keys()
            .zip(inner.by_sequence.keys().skip(1))
            .filter(|(a, b)| *b - *a > 1)
            .count();
        BufferStats {
            segment_count: inner.by_sequence.len(),
            total_bytes: inner.total_bytes,
            total_duration_secs: inner.total_duration,
            oldest_discovered_at: inner.by_time.keys().next().map(|&(ts, _)| ts),
            newest_discovered_at: inner.by_time.keys().next_back().map(|&(ts, _)| ts),
            first_sequence: inner.by_sequence.keys().next().copied(),
            last_sequence: inner.by_sequence.keys().next_back().copied(),
            sequence_gaps,
            memory_segments: inner
                .by_sequence
                .values()
                .filter(|r| matches!(r.bytes, SegmentBytes::Memory(_)))
                .count(),
            buffer_duration_ms: self.buffer_duration_ms as u64,
        }
    }

    /// Evict everything older than the retention horizon, measured from the
    /// current wall time. Returns the number of evicted segments.
    pub async fn prune(&self) -> usize {
        self.prune_at(now_ms()).await
    }

    /// Evict with an explicit notion of "now"; `prune` is the wall-clock
    /// wrapper.
    pub async fn prune_at(&self, now: i64) -> usize {
        let _guard = self.mutate.lock().await;
        let expired = self.evict_expired(now).await;
        if !expired.is_empty() {
            self.write_manifest_snapshot(now).await;
        }
        drop(_guard);
        let count = expired.len();
        for sequence in expired {
            self.events.emit(PipelineEvent::SegmentExpired { sequence });
        }
        count
    }

    /// Wipe the cache: indexes, disk blobs, and the manifest.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.mutate.lock().await;
        let removed: Vec<SegmentRecord> = {
            let mut inner = self.inner.write();
            let records = std::mem::take(&mut inner.by_sequence);
            inner.by_time.clear();
            inner.total_bytes = 0;
            inner.total_duration = 0.0;
            records.into_values().collect()
        };
        for record in &removed {
            if matches!(record.bytes, SegmentBytes::Disk)
                && let Err(e) = self.store.delete_segment(&record.meta.segment_id).await
            {
                warn!(id = %record.meta.segment_id, error = %e, "Blob delete failed");
            }
        }
        self.write_manifest_snapshot(now_ms()).await;
        info!(removed = removed.len(), "Cache cleared");
        Ok(())
    }

    /// Rebuild the in-memory index from disk state.
    ///
    /// Manifest entries whose blob is gone are dropped. On-disk blobs the
    /// manifest does not know about are adopted when their id parses as a
    /// sequence number (with a discovery time extrapolated backward from
    /// the newest known sequence) and deleted otherwise. Ends with a prune
    /// so nothing outside the retention window survives a restart.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let _guard = self.mutate.lock().await;
        let now = now_ms();
        let mut report = RecoveryReport::default();

        let manifest = match self.store.read_manifest().await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Manifest>(&bytes) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(error = %e, "Manifest unreadable; rebuilding from blobs");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Manifest read failed; rebuilding from blobs");
                None
            }
        };

        let mut records: BTreeMap<u64, SegmentRecord> = BTreeMap::new();
        if let Some(manifest) = manifest {
            for entry in manifest.segments {
                let id = &entry.metadata.segment_id;
                if !entry.stored_on_disk || !self.store.segment_exists(id).await {
                    report.dropped += 1;
                    continue;
                }
                report.restored += 1;
                records.insert(
                    entry.metadata.sequence_number,
                    SegmentRecord {
                        discovered_at: entry.timestamp,
                        size: entry.size,
                        bytes: SegmentBytes::Disk,
                        meta: entry.metadata,
                    },
                );
            }
        }

        // Reconcile blobs the manifest does not reference.
        let listed = self.store.list_segments().await?;
        let orphan_seqs: Vec<u64> = listed
            .iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .filter(|seq| !records.contains_key(seq))
            .collect();
        for id in &listed {
            if id.parse::<u64>().is_err() {
                warn!(id = %id, "Deleting unrecognized file in segment directory");
                if let Err(e) = self.store.delete_segment(id).await {
                    warn!(id = %id, error = %e, "Orphan delete failed");
                }
                report.deleted += 1;
            }
        }

        if !orphan_seqs.is_empty() {
            let newest_seq = records
                .keys()
                .next_back()
                .copied()
                .into_iter()
                .chain(orphan_seqs.iter().copied().max())
                .max()
                .unwrap_or(0);
            let fallback_secs = self.target_duration_fallback.as_secs_f64();

            for seq in orphan_seqs {
                let id = seq.to_string();
                let size = match tokio::fs::metadata(self.store.segment_path(&id)).await {
                    Ok(m) => m.len(),
                    Err(_) => 0,
                };
                // Extrapolate backward from the newest sequence so adopted
                // segments keep their relative playback ordering.
                let discovered_at =
                    now - ((newest_seq - seq) as f64 * fallback_secs * 1000.0) as i64;
                records.insert(
                    seq,
                    SegmentRecord {
                        meta: SegmentMetadata {
                            url: self.store.segment_path(&id).display().to_string(),
                            sequence_number: seq,
                            duration: fallback_secs,
                            segment_id: id,
                            added_at: Utc
                                .timestamp_millis_opt(discovered_at)
                                .single()
                                .unwrap_or_else(Utc::now),
                        },
                        discovered_at,
                        size,
                        bytes: SegmentBytes::Disk,
                    },
                );
                report.adopted += 1;
            }
        }

        {
            let mut inner = self.inner.write();
            *inner = CacheInner::default();
            for (_, record) in records {
                inner.insert(record);
            }
        }

        let expired = self.evict_expired(now).await;
        report.pruned = expired.len();
        self.write_manifest_snapshot(now).await;
        drop(_guard);

        info!(
            restored = report.restored,
            adopted = report.adopted,
            dropped = report.dropped,
            pruned = report.pruned,
            "Cache recovery complete"
        );
        Ok(report)
    }

    /// Persist the manifest immediately (used on shutdown).
    pub async fn write_manifest_now(&self) {
        let _guard = self.mutate.lock().await;
        self.write_manifest_snapshot(now_ms()).await;
    }

    /// Remove everything with `discovered_at` older than the horizon.
    /// Caller must hold the mutate lock.
    async fn evict_expired(&self, now: i64) -> Vec<u64> {
        let cutoff = now - self.buffer_duration_ms;
        let victims: Vec<u64> = {
            let inner = self.inner.read();
            inner
                .by_time
                .range(..(cutoff, u64::MIN))
                .map(|(_, &seq)| seq)
                .collect()
        };
        if victims.is_empty() {
            return victims;
        }

        let mut removed = Vec::with_capacity(victims.len());
        {
            let mut inner = self.inner.write();
            for seq in &victims {
                if let Some(record) = inner.remove(*seq) {
                    removed.push(record);
                }
            }
        }
        for record in &removed {
            if matches!(record.bytes, SegmentBytes::Disk)
                && let Err(e) = self.store.delete_segment(&record.meta.segment_id).await
            {
                warn!(id = %record.meta.segment_id, error = %e, "Blob delete failed");
            }
        }
        debug!(evicted = removed.len(), cutoff, "Evicted expired segments");
        removed
            .into_iter()
            .map(|r| r.meta.sequence_number)
            .collect()
    }

    /// Serialize the index to the manifest file. Best-effort: failures are
    /// logged, never propagated; the manifest is reconstructible from the
    /// blob directory.
    async fn write_manifest_snapshot(&self, now: i64) {
        let manifest = {
            let inner = self.inner.read();
            Manifest {
                timestamp: now,
                segments: inner
                    .by_time
                    .values()
                    .filter_map(|seq| inner.by_sequence.get(seq))
                    .map(|r| ManifestEntry {
                        timestamp: r.discovered_at,
                        metadata: r.meta.clone(),
                        size: r.size,
                        stored_on_disk: matches!(r.bytes, SegmentBytes::Disk),
                        file_path: match r.bytes {
                            SegmentBytes::Disk => Some(
                                self.store
                                    .segment_path(&r.meta.segment_id)
                                    .display()
                                    .to_string(),
                            ),
                            SegmentBytes::Memory(_) => None,
                        },
                    })
                    .collect(),
                stats: ManifestStats {
                    total_segments: inner.by_sequence.len(),
                    total_size: inner.total_bytes,
                    total_duration: inner.total_duration,
                    buffer_duration: self.buffer_duration_ms as u64,
                },
            }
        };

        let bytes = match serde_json::to_vec(&manifest) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Manifest serialization failed");
                return;
            }
        };
        if let Err(e) = self.store.write_manifest(&bytes).await {
            warn!(error = %e, "Manifest write failed");
        }
    }
}

/// Fallback identity for segments whose playlist carried no sequence:
/// hash of the URL basename and the wall time.
fn synthesize_sequence(url: &str, now: i64) -> u64 {
    use std::hash::{Hash, Hasher};
    let basename = url.rsplit('/').next().unwrap_or(url);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    basename.hash(&mut hasher);
    now.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    async fn cache_with(
        dir: &std::path::Path,
        buffer_duration: Duration,
    ) -> (Arc<SegmentCache>, Arc<DiskStore>) {
        let store = Arc::new(
            DiskStore::init(&StorageConfig {
                base_dir: dir.to_path_buf(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let cache = Arc::new(SegmentCache::new(
            store.clone(),
            &CacheConfig {
                buffer_duration,
                ..Default::default()
            },
            true,
            Arc::new(EventBus::new()),
        ));
        (cache, store)
    }

    fn meta(seq: u64) -> IngestMetadata {
        IngestMetadata {
            url: format!("https://radio.example.com/seg/{seq}.ts"),
            sequence_number: Some(seq),
            duration: 6.0,
        }
    }

    #[tokio::test]
    async fn add_then_get_roundtrips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        let outcome = cache
            .add_at(1_000, Bytes::from_static(b"payload"), meta(100))
            .await
            .unwrap();
        assert!(outcome.on_disk);
        assert!(!outcome.deduplicated);

        let segment = cache.get_by_sequence(100).await.unwrap();
        assert_eq!(segment.metadata.sequence_number, 100);
        assert_eq!(segment.bytes.unwrap().as_ref(), b"payload");
        assert!(cache.get_by_sequence(101).await.is_none());
    }

    #[tokio::test]
    async fn duplicate_sequence_keeps_first_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        cache
            .add_at(1_000, Bytes::from_static(b"first"), meta(5))
            .await
            .unwrap();
        let second = cache
            .add_at(2_000, Bytes::from_static(b"second"), meta(5))
            .await
            .unwrap();
        assert!(second.deduplicated);

        let segment = cache.get_by_sequence(5).await.unwrap();
        assert_eq!(segment.bytes.unwrap().as_ref(), b"first");
        assert_eq!(cache.stats().segment_count, 1);
    }

    #[tokio::test]
    async fn repeated_add_leaves_state_identical_to_single_add() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        cache
            .add_at(1_000, Bytes::from_static(b"abc"), meta(9))
            .await
            .unwrap();
        let before = cache.stats();
        cache
            .add_at(5_000, Bytes::from_static(b"different"), meta(9))
            .await
            .unwrap();
        let after = cache.stats();

        assert_eq!(before.segment_count, after.segment_count);
        assert_eq!(before.total_bytes, after.total_bytes);
        assert_eq!(before.oldest_discovered_at, after.oldest_discovered_at);
    }

    #[tokio::test]
    async fn get_at_picks_nearest_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        for (ts, seq) in [(1_000, 1u64), (2_000, 2), (4_000, 3)] {
            cache
                .add_at(ts, Bytes::from_static(b"x"), meta(seq))
                .await
                .unwrap();
        }

        // Before the oldest: clamp to oldest.
        assert_eq!(cache.get_at(0).unwrap().metadata.sequence_number, 1);
        // Past the newest: clamp to newest.
        assert_eq!(cache.get_at(9_000).unwrap().metadata.sequence_number, 3);
        // Nearer to 2_000 than 4_000.
        assert_eq!(cache.get_at(2_500).unwrap().metadata.sequence_number, 2);
        // Nearer to 4_000.
        assert_eq!(cache.get_at(3_500).unwrap().metadata.sequence_number, 3);
        // Equidistant between 2_000 and 4_000: earlier wins.
        assert_eq!(cache.get_at(3_000).unwrap().metadata.sequence_number, 2);
    }

    #[tokio::test]
    async fn get_at_on_empty_cache_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_secs(3600)).await;
        assert!(cache.get_at(1_000).is_none());
    }

    #[tokio::test]
    async fn get_range_clamps_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        for (ts, seq) in [(1_000, 1u64), (2_000, 2), (3_000, 3)] {
            cache
                .add_at(ts, Bytes::from_static(b"x"), meta(seq))
                .await
                .unwrap();
        }

        let all = cache.get_range(0, 10_000);
        assert_eq!(
            all.iter()
                .map(|s| s.metadata.sequence_number)
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let middle = cache.get_range(1_500, 2_500);
        assert_eq!(middle.len(), 1);
        assert_eq!(middle[0].metadata.sequence_number, 2);

        assert!(cache.get_range(50_000, 60_000).is_empty());
        assert!(cache.get_range(2_000, 1_000).is_empty());
    }

    #[tokio::test]
    async fn prune_evicts_by_discovery_time_and_deletes_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, store) = cache_with(dir.path(), Duration::from_millis(1_000)).await;

        cache
            .add_at(0, Bytes::from_static(b"a"), meta(1))
            .await
            .unwrap();
        cache
            .add_at(500, Bytes::from_static(b"b"), meta(2))
            .await
            .unwrap();
        cache
            .add_at(1_500, Bytes::from_static(b"c"), meta(3))
            .await
            .unwrap();

        let evicted = cache.prune_at(1_500).await;
        assert_eq!(evicted, 1);
        assert_eq!(cache.stats().segment_count, 2);
        assert!(cache.get_meta(1).is_none());
        assert!(!store.segment_exists("1").await);
        assert!(store.segment_exists("2").await);
        assert!(store.segment_exists("3").await);
    }

    #[tokio::test]
    async fn add_triggers_eviction_of_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_millis(1_000)).await;

        cache
            .add_at(0, Bytes::from_static(b"a"), meta(1))
            .await
            .unwrap();
        cache
            .add_at(2_000, Bytes::from_static(b"b"), meta(2))
            .await
            .unwrap();

        assert!(cache.get_meta(1).is_none());
        assert_eq!(cache.stats().segment_count, 1);
    }

    #[tokio::test]
    async fn out_of_order_ingest_evicts_by_time_not_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_millis(1_000)).await;

        // Newer segment inserted first, older second.
        cache
            .add_at(2_000, Bytes::from_static(b"new"), meta(10))
            .await
            .unwrap();
        cache
            .add_at(100, Bytes::from_static(b"old"), meta(9))
            .await
            .unwrap();

        cache.prune_at(2_100).await;
        assert!(cache.get_meta(9).is_none());
        assert!(cache.get_meta(10).is_some());
    }

    #[tokio::test]
    async fn stats_count_sequence_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        for (ts, seq) in [(1_000, 1u64), (2_000, 2), (3_000, 5), (4_000, 9)] {
            cache
                .add_at(ts, Bytes::from_static(b"x"), meta(seq))
                .await
                .unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.segment_count, 4);
        assert_eq!(stats.sequence_gaps, 2);
        assert_eq!(stats.first_sequence, Some(1));
        assert_eq!(stats.last_sequence, Some(9));
    }

    #[tokio::test]
    async fn clear_wipes_index_blobs_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, store) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        cache
            .add_at(1_000, Bytes::from_static(b"x"), meta(1))
            .await
            .unwrap();
        cache.clear().await.unwrap();

        assert_eq!(cache.stats().segment_count, 0);
        assert!(!store.segment_exists("1").await);
        let manifest: Manifest =
            serde_json::from_slice(&store.read_manifest().await.unwrap().unwrap()).unwrap();
        assert!(manifest.segments.is_empty());
    }

    #[tokio::test]
    async fn memory_fallback_when_disk_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            DiskStore::init(&StorageConfig {
                base_dir: dir.path().to_path_buf(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let cache = SegmentCache::new(
            store.clone(),
            &CacheConfig::default(),
            false,
            Arc::new(EventBus::new()),
        );

        let outcome = cache
            .add_at(1_000, Bytes::from_static(b"mem"), meta(7))
            .await
            .unwrap();
        assert!(!outcome.on_disk);
        assert!(!store.segment_exists("7").await);

        let segment = cache.get_by_sequence(7).await.unwrap();
        assert_eq!(segment.bytes.unwrap().as_ref(), b"mem");
        assert_eq!(cache.stats().memory_segments, 1);
    }

    #[tokio::test]
    async fn recovery_restores_public_state_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, store) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        let base = now_ms();
        for i in 0..10u64 {
            cache
                .add_at(base - 9_000 + i as i64 * 1_000, Bytes::from_static(b"seg"), meta(100 + i))
                .await
                .unwrap();
        }
        let before = cache.stats();
        drop(cache);

        let recovered = SegmentCache::new(
            store.clone(),
            &CacheConfig {
                buffer_duration: Duration::from_secs(3600),
                ..Default::default()
            },
            true,
            Arc::new(EventBus::new()),
        );
        let report = recovered.recover().await.unwrap();
        assert_eq!(report.restored, 10);
        assert_eq!(report.dropped, 0);

        let after = recovered.stats();
        assert_eq!(after.segment_count, before.segment_count);
        assert_eq!(after.total_bytes, before.total_bytes);
        assert_eq!(after.first_sequence, before.first_sequence);
        assert_eq!(after.last_sequence, before.last_sequence);
    }

    #[tokio::test]
    async fn recovery_drops_entries_with_missing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, store) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        let base = now_ms();
        cache
            .add_at(base - 2_000, Bytes::from_static(b"a"), meta(1))
            .await
            .unwrap();
        cache
            .add_at(base - 1_000, Bytes::from_static(b"b"), meta(2))
            .await
            .unwrap();
        drop(cache);

        // Simulate a blob lost between shutdown and restart.
        tokio::fs::remove_file(store.segment_path("1")).await.unwrap();

        let recovered = SegmentCache::new(
            store.clone(),
            &CacheConfig {
                buffer_duration: Duration::from_secs(3600),
                ..Default::default()
            },
            true,
            Arc::new(EventBus::new()),
        );
        let report = recovered.recover().await.unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.dropped, 1);
        assert!(recovered.get_meta(1).is_none());
        assert!(recovered.get_meta(2).is_some());
    }

    #[tokio::test]
    async fn recovery_adopts_orphan_blobs_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, store) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        let base = now_ms();
        for i in 0..10u64 {
            cache
                .add_at(base - 9_000 + i as i64 * 1_000, Bytes::from_static(b"seg"), meta(200 + i))
                .await
                .unwrap();
        }
        drop(cache);
        store.delete_manifest().await.unwrap();

        let recovered = SegmentCache::new(
            store.clone(),
            &CacheConfig {
                buffer_duration: Duration::from_secs(3600),
                ..Default::default()
            },
            true,
            Arc::new(EventBus::new()),
        );
        let report = recovered.recover().await.unwrap();
        assert_eq!(report.adopted, 10);
        assert_eq!(recovered.stats().segment_count, 10);

        // Adopted segments keep ascending discovery order by sequence and
        // still serve bytes.
        for seq in 200..210u64 {
            let segment = recovered.get_by_sequence(seq).await.unwrap();
            assert_eq!(segment.bytes.unwrap().as_ref(), b"seg");
        }
        let times: Vec<i64> = (200..210u64)
            .map(|seq| recovered.get_meta(seq).unwrap().discovered_at)
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn recovery_deletes_unparseable_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, store) = cache_with(dir.path(), Duration::from_secs(3600)).await;
        drop(cache);

        tokio::fs::write(dir.path().join("segments/garbage.ts"), b"junk")
            .await
            .unwrap();

        let recovered = SegmentCache::new(
            store.clone(),
            &CacheConfig::default(),
            true,
            Arc::new(EventBus::new()),
        );
        let report = recovered.recover().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!dir.path().join("segments/garbage.ts").exists());
    }

    #[tokio::test]
    async fn synthesized_sequence_used_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_secs(3600)).await;

        let outcome = cache
            .add_at(
                1_000,
                Bytes::from_static(b"x"),
                IngestMetadata {
                    url: "https://radio.example.com/live/chunk.aac".into(),
                    sequence_number: None,
                    duration: 6.0,
                },
            )
            .await
            .unwrap();
        assert!(cache.get_meta(outcome.sequence_number).is_some());
    }

    #[tokio::test]
    async fn eviction_lag_stays_within_one_cleanup_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache_with(dir.path(), Duration::from_millis(500)).await;

        for i in 0..20u64 {
            cache
                .add_at(i as i64 * 100, Bytes::from_static(b"x"), meta(i))
                .await
                .unwrap();
        }
        let now = 1_900;
        cache.prune_at(now).await;

        if let Some(oldest) = cache.oldest_time() {
            assert!(now - oldest <= 500);
        }
    }
}

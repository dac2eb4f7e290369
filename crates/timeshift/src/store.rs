// Disk store: opaque blob persistence for cached segments plus a single
// metadata manifest. Low-level only; retention policy lives in the cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use std::io::ErrorKind;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::Result;

const SEGMENT_DIR: &str = "segments";
const SEGMENT_EXT: &str = "ts";
const MANIFEST_FILE: &str = "buffer-metadata.json";

/// Filesystem-backed blob store rooted at a base directory.
///
/// Layout:
/// ```text
/// <base_dir>/
///   segments/<id>.ts
///   buffer-metadata.json
/// ```
#[derive(Debug)]
pub struct DiskStore {
    segments_dir: PathBuf,
    manifest_path: PathBuf,
    max_write_retries: u32,
    write_retry_delay: Duration,
    // Manifest writes are serialized; segment writes target distinct ids and
    // need no mutual exclusion.
    manifest_lock: tokio::sync::Mutex<()>,
}

impl DiskStore {
    /// Create the store, ensuring `base_dir` and `base_dir/segments/` exist.
    /// Idempotent.
    pub async fn init(config: &StorageConfig) -> Result<Self> {
        let segments_dir = config.base_dir.join(SEGMENT_DIR);
        tokio::fs::create_dir_all(&segments_dir).await?;
        debug!(dir = %segments_dir.display(), "Disk store initialized");
        Ok(Self {
            segments_dir,
            manifest_path: config.base_dir.join(MANIFEST_FILE),
            max_write_retries: config.max_write_retries.max(1),
            write_retry_delay: config.write_retry_delay,
            manifest_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn segment_path(&self, id: &str) -> PathBuf {
        self.segments_dir.join(format!("{id}.{SEGMENT_EXT}"))
    }

    /// Write a segment blob, retrying transient I/O errors at a fixed delay.
    ///
    /// Atomicity is not required: a torn write leaves a file the cache will
    /// reconcile away on recovery.
    pub async fn write_segment(&self, id: &str, bytes: &Bytes) -> Result<PathBuf> {
        let path = self.segment_path(id);
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 1..=self.max_write_retries {
            match tokio::fs::write(&path, bytes).await {
                Ok(()) => return Ok(path),
                Err(e) => {
                    warn!(
                        id,
                        attempt,
                        max = self.max_write_retries,
                        error = %e,
                        "Segment write failed"
                    );
                    last_err = Some(e);
                    if attempt < self.max_write_retries {
                        tokio::time::sleep(self.write_retry_delay).await;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| std::io::Error::other("segment write failed"))
            .into())
    }

    /// Read a segment blob. A missing file is `Ok(None)`, not an error.
    pub async fn read_segment(&self, id: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.segment_path(id)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a segment blob. Idempotent: a missing file is success.
    pub async fn delete_segment(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.segment_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn segment_exists(&self, id: &str) -> bool {
        tokio::fs::try_exists(self.segment_path(id))
            .await
            .unwrap_or(false)
    }

    /// Enumerate stored segment ids (filenames with the extension stripped).
    ///
    /// Ids that do not parse as sequence numbers are returned as-is; the
    /// cache decides what to do with them.
    pub async fn list_segments(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.segments_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let id = name
                .strip_suffix(&format!(".{SEGMENT_EXT}"))
                .unwrap_or(name);
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    pub async fn write_manifest(&self, bytes: &[u8]) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        tokio::fs::write(&self.manifest_path, bytes).await?;
        Ok(())
    }

    /// Read the manifest. A missing file is `Ok(None)`.
    pub async fn read_manifest(&self) -> Result<Option<Bytes>> {
        match tokio::fs::read(&self.manifest_path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_manifest(&self) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        match tokio::fs::remove_file(&self.manifest_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        self.segments_dir.parent().unwrap_or(&self.segments_dir)
    }
}

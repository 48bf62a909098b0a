//! Resumable upload checkpoints
//!
//! A checkpoint records the multipart upload id and every part the store has
//! acknowledged, so an interrupted upload of the same local file to the same
//! key resumes from the last acknowledged part instead of restarting.
//!
//! Checkpoints are JSON files named after the SHA256 of
//! `(bucket, key, local path)` and are replaced atomically (write + rename).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

/// S3 limit on parts per multipart upload
pub const MAX_PARTS: u64 = 10_000;

/// Identity of the local file a checkpoint was taken against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub size: u64,
    pub modified_millis: Option<i64>,
}

impl FileFingerprint {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let modified_millis = meta
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis());
        Self {
            size: meta.len(),
            modified_millis,
        }
    }
}

/// Byte range of one part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: i32,
    pub offset: u64,
    pub len: u64,
}

/// Part acknowledged by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPart {
    pub part_number: i32,
    pub etag: String,
    pub size: u64,
}

/// Persisted state of one multipart upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub file: FileFingerprint,
    pub part_size: u64,
    #[serde(default)]
    pub parts: Vec<CheckpointPart>,
}

impl UploadCheckpoint {
    pub fn new(
        bucket: &str,
        key: &str,
        upload_id: impl Into<String>,
        file: FileFingerprint,
        part_size: u64,
    ) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.into(),
            file,
            part_size,
            parts: Vec::new(),
        }
    }

    /// Whether this checkpoint can resume an upload of `file` to `bucket/key`
    pub fn matches(&self, bucket: &str, key: &str, file: &FileFingerprint, part_size: u64) -> bool {
        self.bucket == bucket
            && self.key == key
            && self.file == *file
            && self.part_size == part_size
    }

    /// Parts not yet acknowledged, in part-number order
    pub fn pending_parts(&self) -> Vec<PartRange> {
        plan_parts(self.file.size, self.part_size)
            .into_iter()
            .filter(|range| !self.is_acknowledged(range.part_number))
            .collect()
    }

    pub fn is_acknowledged(&self, part_number: i32) -> bool {
        self.parts.iter().any(|p| p.part_number == part_number)
    }

    /// Record an acknowledged part; a repeated part number replaces the old entry
    pub fn record(&mut self, part: CheckpointPart) {
        self.parts.retain(|p| p.part_number != part.part_number);
        self.parts.push(part);
    }

    /// Acknowledged parts sorted by part number
    pub fn completed_parts(&self) -> Vec<CheckpointPart> {
        let mut parts = self.parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    pub fn acknowledged_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }
}

/// Part size actually used for a file, grown if needed to stay within [`MAX_PARTS`]
pub fn effective_part_size(file_size: u64, requested: u64) -> u64 {
    let requested = requested.max(1);
    requested.max(file_size.div_ceil(MAX_PARTS))
}

/// Split a file into part ranges. An empty file is a single empty part.
pub fn plan_parts(file_size: u64, part_size: u64) -> Vec<PartRange> {
    if file_size == 0 {
        return vec![PartRange {
            part_number: 1,
            offset: 0,
            len: 0,
        }];
    }

    let part_size = part_size.max(1);
    let count = file_size.div_ceil(part_size);
    (0..count)
        .map(|i| {
            let offset = i * part_size;
            PartRange {
                part_number: (i + 1) as i32,
                offset,
                len: part_size.min(file_size - offset),
            }
        })
        .collect()
}

/// Directory of checkpoint files
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Checkpoint file for an upload of `local_path` to `bucket/key`
    pub fn path_for(&self, bucket: &str, key: &str, local_path: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(bucket.as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(local_path.to_string_lossy().as_bytes());
        self.dir.join(format!("{}.ucp", hex::encode(hasher.finalize())))
    }

    /// Load a checkpoint. Missing files yield `None`; unreadable ones are
    /// discarded.
    pub async fn load(&self, path: &Path) -> Option<UploadCheckpoint> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read checkpoint");
                return None;
            }
        };

        match serde_json::from_slice(&content) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Discarding corrupt checkpoint"
                );
                self.remove(path).await;
                None
            }
        }
    }

    pub async fn save(&self, path: &Path, checkpoint: &UploadCheckpoint) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec(checkpoint).map_err(io::Error::other)?;
        let tmp = path.with_extension("ucp.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await
    }

    /// Remove a checkpoint, logging failures
    pub async fn remove(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove checkpoint");
            }
        }
    }
}

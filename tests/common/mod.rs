//! Shared test infrastructure
//!
//! - [`MemoryStore`]: in-process [`ObjectStore`] with fault injection and
//!   concurrency tracking
//! - config and zip fixture helpers

#![allow(dead_code)]

use async_trait::async_trait;
use hakobu::config::{Config, PoolConfig, StoreConfig, MIN_PART_SIZE};
use hakobu::s3::{ObjectStore, PutSource, ResumableOptions, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const TEST_BUCKET: &str = "test-bucket";

/// Content containing this marker is rejected by [`MemoryStore`]
pub const FAIL_MARKER: &[u8] = b"FAIL";

/// In-memory object store
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    delay: Duration,
    fail_ensure: bool,
    pub ensure_calls: AtomicUsize,
    pub put_calls: AtomicUsize,
    pub resumable_calls: AtomicUsize,
    pub abandon_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transfer takes at least `delay`
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Bucket ensure always fails
    pub fn unavailable() -> Self {
        Self {
            fail_ensure: true,
            ..Self::default()
        }
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
            + self.put_calls.load(Ordering::SeqCst)
            + self.resumable_calls.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Object behind a URL returned by this store
    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        let key = url.strip_prefix(&format!("memory://{TEST_BUCKET}/"))?;
        self.objects.lock().get(key).cloned()
    }

    async fn store(&self, key: &str, body: Vec<u8>) -> Result<String, StoreError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if body.windows(FAIL_MARKER.len()).any(|w| w == FAIL_MARKER) {
            return Err(StoreError::rejected("InjectedFailure", "content rejected"));
        }
        self.objects.lock().insert(key.to_string(), body);
        Ok(self.object_url(TEST_BUCKET, key))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_bucket(&self, _bucket: &str) -> Result<(), StoreError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ensure {
            return Err(StoreError::Unavailable {
                message: "connection refused".into(),
            });
        }
        Ok(())
    }

    async fn put_object(
        &self,
        _bucket: &str,
        key: &str,
        source: PutSource,
    ) -> Result<String, StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let body = match source {
            PutSource::Bytes(bytes) => bytes.to_vec(),
            PutSource::Path(path) => tokio::fs::read(path).await?,
        };
        self.store(key, body).await
    }

    async fn upload_resumable(
        &self,
        _bucket: &str,
        key: &str,
        local_path: &Path,
        _options: &ResumableOptions,
    ) -> Result<String, StoreError> {
        self.resumable_calls.fetch_add(1, Ordering::SeqCst);
        let body = tokio::fs::read(local_path).await?;
        self.store(key, body).await
    }

    async fn abandon_resumable(
        &self,
        _bucket: &str,
        _key: &str,
        _local_path: &Path,
        _options: &ResumableOptions,
    ) -> Result<(), StoreError> {
        self.abandon_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{bucket}/{key}")
    }
}

/// Config with staging and scratch space under `root`
pub fn test_config(root: &Path, core_size: usize, max_size: usize) -> Config {
    let mut store = StoreConfig::new(TEST_BUCKET);
    store.min_part_size = MIN_PART_SIZE;
    let mut config = Config::with_store(store);
    config.pool = PoolConfig {
        core_size,
        max_size,
        keep_alive_secs: 60,
    };
    config.upload.staging_root = root.join("staging");
    config.upload.checkpoint = false;
    config.archive.scratch_root = Some(root.join("scratch"));
    config.metrics.enabled = false;
    config
}

/// Number of entries left in a directory (0 if it does not exist)
pub fn entries_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Zip archive with the given entries; names ending in `/` are directories
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, body) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Zip archive with one entry whose name is stored as GBK bytes without the
/// UTF-8 flag, the way Windows archivers on Chinese locales write it
pub fn gbk_zip_bytes(name: &str, body: &[u8]) -> Vec<u8> {
    let (gbk, _, _) = encoding_rs::GBK.encode(name);
    // ASCII placeholder of the same byte length keeps the UTF-8 flag unset
    let placeholder: String = "q".repeat(gbk.len());
    let mut archive = zip_bytes(&[(placeholder.as_str(), body)]);

    let needle = placeholder.as_bytes();
    let mut i = 0;
    while i + needle.len() <= archive.len() {
        if &archive[i..i + needle.len()] == needle {
            archive[i..i + needle.len()].copy_from_slice(&gbk);
            i += needle.len();
        } else {
            i += 1;
        }
    }
    archive
}

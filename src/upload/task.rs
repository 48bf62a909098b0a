//! Single-file upload task
//!
//! A task stages its request (unless it arrives prestaged), ensures the
//! bucket, transfers the file and releases the staged copy. Every failure is
//! turned into an [`UploadOutcome::Failure`]; nothing escapes `run`.

use super::key::{generate_key, join_prefix, KeyStyle};
use super::staging::{stage_request, StagedFile};
use super::{UploadError, UploadOutcome, UploadRequest};
use crate::config::Config;
use crate::metrics;
use crate::s3::{ObjectStore, PutSource, ResumableOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Pause before the next resumable attempt, scaled by the attempt number
const RESUME_BACKOFF: Duration = Duration::from_millis(100);

/// Settings shared by every task of an uploader
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub bucket: String,
    /// Key prefix for direct uploads, also the staging subdirectory
    pub context_path: String,
    pub staging_root: PathBuf,
    pub resumable: ResumableOptions,
}

impl TaskSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bucket: config.store.bucket.clone(),
            context_path: config.upload.context_path.clone(),
            staging_root: config.upload.staging_root.clone(),
            resumable: ResumableOptions::from_config(&config.upload, &config.store),
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        let relative = join_prefix(&[&self.context_path]);
        self.staging_root.join(relative.trim_end_matches('/'))
    }

    /// Files below one part go through a single put
    fn wants_single_put(&self, size: u64) -> bool {
        size < self.resumable.part_size_bytes()
    }
}

enum Source {
    Request(UploadRequest),
    Staged(StagedFile),
}

/// One unit of work for the pool
pub struct UploadTask {
    source: Source,
    settings: Arc<TaskSettings>,
}

impl UploadTask {
    /// Task that stages `request` before uploading it
    pub fn staged(request: UploadRequest, settings: Arc<TaskSettings>) -> Self {
        Self {
            source: Source::Request(request),
            settings,
        }
    }

    /// Task for a file already on disk with its key assigned
    pub fn prestaged(file: StagedFile, settings: Arc<TaskSettings>) -> Self {
        Self {
            source: Source::Staged(file),
            settings,
        }
    }

    /// Name used in logs
    pub fn name(&self) -> String {
        match &self.source {
            Source::Request(request) => request.original_name().to_string(),
            Source::Staged(file) => file.remote_key().to_string(),
        }
    }

    pub async fn run(self, store: Arc<dyn ObjectStore>) -> UploadOutcome {
        let span = tracing::info_span!(
            "upload.task",
            file = %self.name(),
            s3.key = tracing::field::Empty,
            upload.bytes = tracing::field::Empty
        );
        let bucket = self.settings.bucket.clone();

        async move {
            let started = Instant::now();
            match self.execute(store.as_ref()).await {
                Ok((url, bytes, method)) => {
                    let elapsed = started.elapsed();
                    metrics::record_upload_success(&bucket, bytes);
                    metrics::record_upload_duration(&bucket, method, elapsed.as_secs_f64());
                    tracing::info!(
                        url = %url,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Upload succeeded"
                    );
                    UploadOutcome::success(url)
                }
                Err(error) => {
                    metrics::record_upload_failure(&bucket);
                    metrics::record_error(error.kind().as_str());
                    tracing::warn!(error = %error, "Upload failed");
                    UploadOutcome::failure(error)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        self,
        store: &dyn ObjectStore,
    ) -> Result<(String, u64, &'static str), UploadError> {
        let settings = self.settings;
        let staged = match self.source {
            Source::Request(request) => {
                let key = generate_key(
                    &settings.context_path,
                    request.original_name(),
                    KeyStyle::Compact,
                );
                stage_request(request, &settings.staging_dir(), key).await?
            }
            Source::Staged(file) => file,
        };

        let span = tracing::Span::current();
        span.record("s3.key", staged.remote_key());
        span.record("upload.bytes", staged.size());

        let result = transfer(store, &settings, &staged).await;
        let size = staged.size();
        staged.release().await;
        result.map(|(url, method)| (url, size, method))
    }
}

async fn transfer(
    store: &dyn ObjectStore,
    settings: &TaskSettings,
    staged: &StagedFile,
) -> Result<(String, &'static str), UploadError> {
    store
        .ensure_bucket(&settings.bucket)
        .await
        .map_err(UploadError::StoreUnavailable)?;

    let key = staged.remote_key();
    if settings.wants_single_put(staged.size()) {
        let url = store
            .put_object(
                &settings.bucket,
                key,
                PutSource::Path(staged.local_path().to_path_buf()),
            )
            .await
            .map_err(|e| UploadError::from_store(key, e))?;
        Ok((url, "put_object"))
    } else {
        let url = upload_with_resume(store, settings, staged).await?;
        Ok((url, "multipart"))
    }
}

/// Resumable upload with a bounded number of attempts on the same key and
/// staged path, so each retry picks up the checkpoint of the last one.
/// The final failure abandons the multipart upload before the file is released.
async fn upload_with_resume(
    store: &dyn ObjectStore,
    settings: &TaskSettings,
    staged: &StagedFile,
) -> Result<String, UploadError> {
    let bucket = settings.bucket.as_str();
    let key = staged.remote_key();
    let path = staged.local_path();
    let options = &settings.resumable;
    let attempts = options.attempts.max(1);

    let mut attempt = 1;
    loop {
        match store.upload_resumable(bucket, key, path, options).await {
            Ok(url) => return Ok(url),
            Err(e) if attempt < attempts && e.is_retryable() => {
                tracing::warn!(
                    attempt,
                    attempts,
                    error = %e,
                    "Resumable upload failed, resuming"
                );
                tokio::time::sleep(RESUME_BACKOFF * attempt as u32).await;
                attempt += 1;
            }
            Err(e) => {
                if let Err(abandon) = store.abandon_resumable(bucket, key, path, options).await {
                    tracing::warn!(error = %abandon, "Failed to abandon resumable upload");
                }
                return Err(UploadError::from_store(key, e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::{MockObjectStore, StoreError};
    use crate::upload::ErrorKind;

    fn settings(root: &std::path::Path) -> Arc<TaskSettings> {
        Arc::new(TaskSettings {
            bucket: "banners".into(),
            context_path: "uploads/".into(),
            staging_root: root.to_path_buf(),
            resumable: ResumableOptions {
                min_part_size: crate::config::MIN_PART_SIZE,
                checkpoint: false,
                checkpoint_dir: root.join(".checkpoints"),
                ..ResumableOptions::default()
            },
        })
    }

    #[test]
    fn test_staging_dir_under_context_path() {
        let settings = settings(std::path::Path::new("/var/staging"));
        assert_eq!(settings.staging_dir(), PathBuf::from("/var/staging/uploads"));
    }

    #[tokio::test]
    async fn test_small_file_uses_put_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store
            .expect_ensure_bucket()
            .withf(|bucket| bucket == "banners")
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_put_object()
            .times(1)
            .returning(|bucket, key, source| {
                assert!(key.starts_with("uploads/"));
                assert!(key.ends_with(".txt"));
                match source {
                    PutSource::Path(path) => {
                        assert_eq!(std::fs::read(path).unwrap(), b"hello");
                    }
                    PutSource::Bytes(_) => panic!("expected staged path"),
                }
                Ok(format!("http://store/{bucket}/{key}"))
            });
        store.expect_upload_resumable().never();

        let task = UploadTask::staged(
            UploadRequest::from_bytes("note.txt", "hello"),
            settings(dir.path()),
        );
        let outcome = task.run(Arc::new(store)).await;

        assert!(outcome.url().unwrap().starts_with("http://store/banners/uploads/"));
        let leftover = std::fs::read_dir(dir.path().join("uploads")).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn test_large_file_uses_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store.expect_ensure_bucket().returning(|_| Ok(()));
        store.expect_put_object().never();
        store
            .expect_upload_resumable()
            .times(1)
            .returning(|_, key, _, options| {
                assert_eq!(options.task_num, 5);
                Ok(format!("http://store/{key}"))
            });

        let data = vec![7u8; 1024 * 1024 + 1];
        let task = UploadTask::staged(
            UploadRequest::from_bytes("big.bin", data),
            settings(dir.path()),
        );
        assert!(task.run(Arc::new(store)).await.is_success());
    }

    /// Default endpoint minimum keeps a 1 MiB file on the single put path
    #[test]
    fn test_single_put_below_endpoint_minimum() {
        let mut settings = (*settings(std::path::Path::new("/tmp"))).clone();
        settings.resumable.min_part_size = crate::config::DEFAULT_STORE_MIN_PART_SIZE;
        assert!(settings.wants_single_put(1024 * 1024 + 1));
        assert!(settings.wants_single_put(5 * 1024 * 1024 - 1));
        assert!(!settings.wants_single_put(5 * 1024 * 1024));
    }

    // ========================================================================
    // RESUMABLE RETRIES
    // ========================================================================

    fn unavailable() -> StoreError {
        StoreError::Unavailable {
            message: "connection reset".into(),
        }
    }

    /// Every attempt reuses the key and staged path; the last failure
    /// abandons the upload once, before the staged copy is released
    #[tokio::test]
    async fn test_resumable_retries_same_key_then_abandons() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut store = MockObjectStore::new();
        store.expect_ensure_bucket().returning(|_| Ok(()));
        let record = Arc::clone(&seen);
        store
            .expect_upload_resumable()
            .times(3)
            .returning(move |_, key, path, _| {
                assert!(path.exists());
                record.lock().push((key.to_string(), path.to_path_buf()));
                Err(unavailable())
            });
        let abandoned = Arc::clone(&seen);
        store
            .expect_abandon_resumable()
            .times(1)
            .returning(move |_, key, path, _| {
                assert!(path.exists(), "abandon runs before release");
                assert_eq!(abandoned.lock()[0], (key.to_string(), path.to_path_buf()));
                Ok(())
            });

        let task = UploadTask::staged(
            UploadRequest::from_bytes("big.bin", vec![1u8; 1024 * 1024 + 1]),
            settings(dir.path()),
        );
        let outcome = task.run(Arc::new(store)).await;

        assert_eq!(outcome.error().unwrap().kind(), ErrorKind::StoreUnavailable);
        let attempts = seen.lock();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| *a == attempts[0]));
        assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
    }

    /// A retry that succeeds leaves nothing to abandon
    #[tokio::test]
    async fn test_resumable_retry_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut store = MockObjectStore::new();
        store.expect_ensure_bucket().returning(|_| Ok(()));
        let counter = Arc::clone(&calls);
        store
            .expect_upload_resumable()
            .times(2)
            .returning(move |_, key, _, _| {
                if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    Err(unavailable())
                } else {
                    Ok(format!("http://store/{key}"))
                }
            });
        store.expect_abandon_resumable().never();

        let task = UploadTask::staged(
            UploadRequest::from_bytes("big.bin", vec![1u8; 1024 * 1024 + 1]),
            settings(dir.path()),
        );
        assert!(task.run(Arc::new(store)).await.is_success());
    }

    /// A refusal is not retried
    #[tokio::test]
    async fn test_resumable_rejection_abandons_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store.expect_ensure_bucket().returning(|_| Ok(()));
        store
            .expect_upload_resumable()
            .times(1)
            .returning(|_, _, _, _| Err(StoreError::rejected("AccessDenied", "Access Denied")));
        store
            .expect_abandon_resumable()
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let task = UploadTask::staged(
            UploadRequest::from_bytes("big.bin", vec![1u8; 1024 * 1024 + 1]),
            settings(dir.path()),
        );
        let outcome = task.run(Arc::new(store)).await;
        assert_eq!(outcome.error().unwrap().kind(), ErrorKind::TransferFailed);
    }

    #[tokio::test]
    async fn test_bucket_failure_is_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store.expect_ensure_bucket().returning(|_| {
            Err(StoreError::Unavailable {
                message: "connect timeout".into(),
            })
        });
        store.expect_put_object().never();

        let task = UploadTask::staged(
            UploadRequest::from_bytes("a.png", "png"),
            settings(dir.path()),
        );
        let outcome = task.run(Arc::new(store)).await;
        assert_eq!(outcome.error().unwrap().kind(), ErrorKind::StoreUnavailable);
        // Staged copy is still released
        assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_transfer_is_transfer_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockObjectStore::new();
        store.expect_ensure_bucket().returning(|_| Ok(()));
        store
            .expect_put_object()
            .returning(|_, _, _| Err(StoreError::rejected("AccessDenied", "Access Denied")));

        let task = UploadTask::staged(
            UploadRequest::from_bytes("a.png", "png"),
            settings(dir.path()),
        );
        let outcome = task.run(Arc::new(store)).await;
        assert_eq!(outcome.error().unwrap().kind(), ErrorKind::TransferFailed);
    }

    #[tokio::test]
    async fn test_prestaged_retained_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf.txt");
        std::fs::write(&path, b"leaf").unwrap();

        let mut store = MockObjectStore::new();
        store.expect_ensure_bucket().returning(|_| Ok(()));
        store
            .expect_put_object()
            .withf(|_, key, _| key == "banner/dir/k.txt")
            .returning(|_, key, _| Ok(key.to_string()));

        let task = UploadTask::prestaged(
            StagedFile::retained(&path, "banner/dir/k.txt", 4),
            settings(dir.path()),
        );
        assert_eq!(task.name(), "banner/dir/k.txt");
        assert_eq!(task.run(Arc::new(store)).await.url(), Some("banner/dir/k.txt"));
        assert!(path.exists());
    }
}

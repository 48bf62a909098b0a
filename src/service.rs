//! Upload service
//!
//! [`Uploader`] owns the store handle and the worker pool for the process and
//! exposes the batch entry points.
//!
//! # Example
//!
//! ```no_run
//! use hakobu::config::Config;
//! use hakobu::s3::{S3Client, S3ClientConfig};
//! use hakobu::service::Uploader;
//! use hakobu::upload::UploadRequest;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let store = Arc::new(S3Client::connect(S3ClientConfig::from(&config.store)).await?);
//! let uploader = Uploader::new(&config, store)?;
//!
//! let outcomes = uploader
//!     .upload_concurrent_batch(vec![UploadRequest::from_path("banner.png").await?])
//!     .await;
//! for outcome in outcomes {
//!     println!("{:?}", outcome.url());
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::{ArchiveConfig, Config};
use crate::pool::{PoolError, PoolStats, WorkerPool};
use crate::s3::ObjectStore;
use crate::timing::timed;
use crate::upload::archive::{self, encoding_for_label};
use crate::upload::{
    BatchOrchestrator, IndexedOutcome, TaskSettings, UploadError, UploadOutcome, UploadRequest,
};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Encoding assumed for archives routed through [`Uploader::upload_auto`]
pub const AUTO_ARCHIVE_ENCODING: &str = "gbk";

/// Batch upload façade
#[derive(Debug, Clone)]
pub struct Uploader {
    orchestrator: BatchOrchestrator,
    archive: ArchiveConfig,
}

impl Uploader {
    /// Build the pool; no workers start until the first concurrent batch
    pub fn new(config: &Config, store: Arc<dyn ObjectStore>) -> Result<Self, PoolError> {
        let pool = Arc::new(WorkerPool::from_config(&config.pool)?);
        Ok(Self::with_pool(config, store, pool))
    }

    /// Share an existing pool
    pub fn with_pool(config: &Config, store: Arc<dyn ObjectStore>, pool: Arc<WorkerPool>) -> Self {
        let settings = Arc::new(TaskSettings::from_config(config));
        Self {
            orchestrator: BatchOrchestrator::new(pool, store, settings),
            archive: config.archive.clone(),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.orchestrator.pool().stats()
    }

    /// Upload one file after another; the baseline against the pool
    pub async fn upload_single_batch(&self, requests: Vec<UploadRequest>) -> Vec<UploadOutcome> {
        timed("sequential", self.orchestrator.run_sequential(requests)).await
    }

    /// Upload concurrently on the worker pool; outcomes in input order
    pub async fn upload_concurrent_batch(&self, requests: Vec<UploadRequest>) -> Vec<UploadOutcome> {
        timed("concurrent", self.orchestrator.run_batch(requests)).await
    }

    /// Concurrent upload that `cancel` can interrupt; outcomes in completion
    /// order
    pub async fn upload_concurrent_batch_cancellable(
        &self,
        requests: Vec<UploadRequest>,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexedOutcome>, UploadError> {
        timed("concurrent", self.orchestrator.run_batch_indexed(requests, cancel)).await
    }

    /// Expand a zip and upload every file in it under `prefix`, keeping the
    /// archive's directory layout in the keys. One outcome per file; the
    /// extracted tree is removed whatever happens.
    ///
    /// `encoding` defaults to `archive.default_encoding`.
    pub async fn upload_archive<R>(
        &self,
        zip: R,
        encoding: Option<&str>,
        prefix: &str,
    ) -> Result<Vec<UploadOutcome>, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let label = encoding.unwrap_or(&self.archive.default_encoding);
        let encoding = encoding_for_label(label)?;

        timed("archive", async {
            let tree = archive::expand(zip, encoding, &self.archive.scratch_root()).await?;

            let root = tree.root().to_path_buf();
            let key_prefix = prefix.to_string();
            let walked = tokio::task::spawn_blocking(move || archive::traverse(&root, &key_prefix))
                .await
                .map_err(|e| UploadError::ArchiveCorrupt(format!("traversal task failed: {e}")))
                .and_then(|r| r.map_err(|e| UploadError::ArchiveCorrupt(e.to_string())));

            let outcomes = match walked {
                Ok(files) => Ok(self.orchestrator.run_prestaged(files).await),
                Err(e) => Err(e),
            };

            if let Err(e) = tree.remove().await {
                tracing::warn!(error = %e, "Failed to remove extracted archive");
            }
            outcomes
        })
        .await
    }

    /// Zip files are expanded (GBK entry names) under `prefix`; anything else
    /// is uploaded as a single object.
    pub async fn upload_auto(
        &self,
        request: UploadRequest,
        prefix: &str,
    ) -> Result<Vec<UploadOutcome>, UploadError> {
        if request.is_zip() {
            let (name, content) = request.into_parts();
            tracing::info!(file = %name, "Expanding archive upload");
            self.upload_archive(content, Some(AUTO_ARCHIVE_ENCODING), prefix)
                .await
        } else {
            Ok(self.upload_concurrent_batch(vec![request]).await)
        }
    }
}

//! Object store client
//!
//! One shared handle on an S3-compatible endpoint, built on `aws-sdk-s3`.
//!
//! # Operations
//!
//! | Operation | Span Name | Store calls |
//! |-----------|-----------|-------------|
//! | ensure_bucket | `s3.ensure_bucket` | HeadBucket, CreateBucket, PutBucketAcl |
//! | put_object | `s3.put_object` | PutObject |
//! | upload_resumable | `s3.upload_resumable` | Create/UploadPart/Complete/AbortMultipartUpload |
//!
//! `S3Client` is `Send + Sync`; every upload task in the process shares one
//! instance (see [`shared`]) without external locking.
//!
//! # Example
//!
//! ```no_run
//! use hakobu::s3::{ObjectStore, PutSource, S3Client, S3ClientConfig};
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = S3ClientConfig::new("banners");
//! config.endpoint = Some("http://localhost:9000".into());
//! config.access_key = Some("minioadmin".into());
//! config.secret_key = Some("minioadmin".into());
//!
//! let client = S3Client::connect(config).await?;
//! client.ensure_bucket("banners").await?;
//! let url = client
//!     .put_object("banners", "hello.txt", PutSource::Bytes(Bytes::from("Hello")))
//!     .await?;
//! println!("{url}");
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod credentials;
pub mod shared;

pub use checkpoint::{CheckpointStore, UploadCheckpoint};
pub use credentials::{Credentials, CredentialsError, CredentialsProvider};

use crate::config::{
    RetryConfig, StoreConfig, TimeoutConfig, UploadConfig, DEFAULT_STORE_MIN_PART_SIZE,
    MIN_PART_SIZE,
};
use crate::metrics;
use async_trait::async_trait;
use aws_sdk_s3::config::retry::RetryConfig as SdkRetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig as SdkTimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_sdk_s3::operation::RequestId;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketCannedAcl, BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
    CreateBucketConfiguration,
};
use bytes::Bytes;
use checkpoint::{effective_part_size, CheckpointPart, FileFingerprint, PartRange};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::OnceCell;

/// Store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The store could not be reached, or a control-plane call failed
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// The store answered and refused the request
    #[error(
        "Store rejected request: {message} (code: {}, request id: {})",
        .code.as_deref().unwrap_or("-"),
        .request_id.as_deref().unwrap_or("-")
    )]
    Rejected {
        message: String,
        code: Option<String>,
        request_id: Option<String>,
        status: Option<u16>,
    },

    #[error("Local file error: {0}")]
    Io(String),
}

impl StoreError {
    /// Rejection with a service error code, used by test doubles and fault injection
    pub fn rejected(code: &str, message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            code: Some(code.to_string()),
            request_id: None,
            status: None,
        }
    }

    /// Worth another attempt: the store was unreachable or answered with a
    /// server-side or throttling status
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Rejected {
                status: Some(status),
                ..
            } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Reclassify as a control-plane failure, keeping the detail
    fn into_unavailable(self) -> Self {
        match self {
            Self::Unavailable { .. } => self,
            other => Self::Unavailable {
                message: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Classify an SDK error: service responses are rejections, everything else
/// (dispatch, timeout, construction) means the store is unavailable.
fn classify<E>(err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + RequestId + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(service) => {
            let inner = service.err();
            StoreError::Rejected {
                message: inner
                    .message()
                    .map(String::from)
                    .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
                code: inner.code().map(String::from),
                request_id: inner.request_id().map(String::from),
                status: Some(service.raw().status().as_u16()),
            }
        }
        _ => StoreError::Unavailable {
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

fn is_bucket_not_found(err: &SdkError<HeadBucketError>) -> bool {
    match err {
        SdkError::ServiceError(service) => {
            service.err().is_not_found() || service.raw().status().as_u16() == 404
        }
        _ => false,
    }
}

/// Single-shot upload source
#[derive(Debug, Clone)]
pub enum PutSource {
    Bytes(Bytes),
    Path(PathBuf),
}

/// Options for [`ObjectStore::upload_resumable`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumableOptions {
    /// Parts in flight at once
    pub task_num: usize,
    /// Bytes per part, raised to `min_part_size`
    pub part_size: usize,
    /// Smallest non-final part the endpoint accepts, never below [`MIN_PART_SIZE`]
    pub min_part_size: usize,
    /// Persist acknowledged parts so an interrupted upload can resume
    pub checkpoint: bool,
    pub checkpoint_dir: PathBuf,
    /// Calls to [`ObjectStore::upload_resumable`] per file before giving up
    pub attempts: usize,
}

impl Default for ResumableOptions {
    fn default() -> Self {
        Self {
            task_num: 5,
            part_size: 1024 * 1024,
            min_part_size: DEFAULT_STORE_MIN_PART_SIZE,
            checkpoint: true,
            checkpoint_dir: std::env::temp_dir().join("hakobu-checkpoints"),
            attempts: 3,
        }
    }
}

impl ResumableOptions {
    pub fn from_config(upload: &UploadConfig, store: &StoreConfig) -> Self {
        Self {
            task_num: upload.task_num.max(1),
            part_size: upload.part_size,
            min_part_size: store.min_part_size,
            checkpoint: upload.checkpoint,
            checkpoint_dir: upload.checkpoint_dir(),
            attempts: upload.resume_attempts.max(1),
        }
    }

    /// Part size after clamping to the endpoint minimum
    pub fn part_size_bytes(&self) -> u64 {
        self.part_size
            .max(self.min_part_size)
            .max(MIN_PART_SIZE) as u64
    }
}

/// Remote object store operations used by upload tasks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Make sure `bucket` exists, creating it with public-read access if not
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// Single-shot upload; returns the object URL
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: PutSource,
    ) -> Result<String, StoreError>;

    /// Chunked, checkpointed upload of a local file; returns the object URL
    async fn upload_resumable(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        options: &ResumableOptions,
    ) -> Result<String, StoreError>;

    /// Give up on a resumable upload of `local_path` to `key`: abort the
    /// multipart upload recorded in its checkpoint and remove the checkpoint
    async fn abandon_resumable(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        options: &ResumableOptions,
    ) -> Result<(), StoreError>;

    /// Public URL of an object
    fn object_url(&self, bucket: &str, key: &str) -> String;
}

/// S3 Client configuration
#[derive(Debug, Clone)]
pub struct S3ClientConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub public_base_url: Option<String>,
    pub force_path_style: bool,
    pub retry: Option<RetryConfig>,
    pub timeout: Option<TimeoutConfig>,
}

impl S3ClientConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            public_base_url: None,
            force_path_style: true,
            retry: None,
            timeout: None,
        }
    }
}

impl From<&StoreConfig> for S3ClientConfig {
    fn from(store: &StoreConfig) -> Self {
        Self {
            bucket: store.bucket.clone(),
            region: store.region.clone(),
            endpoint: store.endpoint.clone(),
            access_key: store.access_key.clone(),
            secret_key: store.secret_key.clone(),
            public_base_url: store.public_base_url.clone(),
            force_path_style: store.force_path_style,
            retry: Some(store.retry.clone()),
            timeout: Some(store.timeout.clone()),
        }
    }
}

/// Ensure state of one bucket
#[derive(Debug, Default)]
struct BucketState {
    /// Set once the bucket exists with public-read; concurrent first callers
    /// wait on it, failures leave it empty for the next caller
    ensured: OnceCell<()>,
    /// Created by this process, public-read not applied yet
    acl_pending: AtomicBool,
}

/// S3 Client
pub struct S3Client {
    config: S3ClientConfig,
    client: aws_sdk_s3::Client,
    buckets: Mutex<HashMap<String, Arc<BucketState>>>,
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Client")
            .field("bucket", &self.config.bucket)
            .field("region", &self.config.region)
            .field("endpoint", &self.config.endpoint)
            .finish()
    }
}

impl S3Client {
    /// Create a client from static credentials (configuration or environment)
    pub fn new(config: S3ClientConfig) -> Result<Self, StoreError> {
        let credentials = CredentialsProvider::resolve(&config).ok_or_else(|| {
            StoreError::ConfigError("no static credentials in config or environment".into())
        })?;

        let builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(aws_credential_types::Credentials::from(&credentials));

        Ok(Self::from_builder(config, builder))
    }

    /// Create a client, falling back to the SDK default credential chain
    pub async fn connect(config: S3ClientConfig) -> Result<Self, StoreError> {
        if CredentialsProvider::resolve(&config).is_some() {
            return Self::new(config);
        }

        tracing::debug!("No static credentials, using the default provider chain");
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;
        let builder = aws_sdk_s3::config::Builder::from(&shared);
        Ok(Self::from_builder(config, builder))
    }

    fn from_builder(config: S3ClientConfig, builder: aws_sdk_s3::config::Builder) -> Self {
        let retry = config.retry.clone().unwrap_or_default();
        let timeout = config.timeout.clone().unwrap_or_default();

        let mut builder = builder
            .region(Region::new(config.region.clone()))
            .force_path_style(config.force_path_style)
            .retry_config(SdkRetryConfig::standard().with_max_attempts(retry.max_attempts.max(1)))
            .timeout_config(
                SdkTimeoutConfig::builder()
                    .operation_timeout(timeout.operation())
                    .build(),
            );

        if let Some(ref endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }

        tracing::info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            "Object store client created"
        );

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Get the configured bucket name
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// Get the endpoint URL
    pub fn endpoint(&self) -> String {
        self.config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.config.region))
    }

    async fn create_bucket_if_missing(
        &self,
        bucket: &str,
        state: &BucketState,
    ) -> Result<(), StoreError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) if !state.acl_pending.load(Ordering::SeqCst) => {
                tracing::debug!(bucket = %bucket, "Bucket exists");
                return Ok(());
            }
            Ok(_) => {
                tracing::info!(bucket = %bucket, "Bucket exists, retrying public-read");
                return self.make_public(bucket, state).await;
            }
            Err(err) if is_bucket_not_found(&err) => {}
            Err(err) => return Err(classify(err).into_unavailable()),
        }

        let mut request = self.client.create_bucket().bucket(bucket);
        if self.config.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(
                        self.config.region.as_str(),
                    ))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => tracing::info!(bucket = %bucket, "Created bucket"),
            Err(SdkError::ServiceError(service))
                if service.err().is_bucket_already_owned_by_you() =>
            {
                tracing::debug!(bucket = %bucket, "Bucket created concurrently");
            }
            Err(err) => return Err(classify(err).into_unavailable()),
        }

        state.acl_pending.store(true, Ordering::SeqCst);
        self.make_public(bucket, state).await
    }

    async fn make_public(&self, bucket: &str, state: &BucketState) -> Result<(), StoreError> {
        self.client
            .put_bucket_acl()
            .bucket(bucket)
            .acl(BucketCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| classify(e).into_unavailable())?;

        state.acl_pending.store(false, Ordering::SeqCst);
        tracing::info!(bucket = %bucket, "Bucket set to public-read");
        Ok(())
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        output
            .upload_id()
            .map(String::from)
            .ok_or_else(|| StoreError::Rejected {
                message: "CreateMultipartUpload returned no upload id".into(),
                code: None,
                request_id: output.request_id().map(String::from),
                status: None,
            })
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, bucket, key, local_path),
        fields(
            s3.upload_id = %upload_id,
            s3.part_number = range.part_number,
            upload.bytes = range.len
        ),
        err
    )]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        local_path: &Path,
        range: PartRange,
    ) -> Result<CheckpointPart, StoreError> {
        let body = read_part(local_path, range).await?;

        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(range.part_number)
            .content_length(range.len as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;

        Ok(CheckpointPart {
            part_number: range.part_number,
            etag: output.e_tag().unwrap_or_default().to_string(),
            size: range.len,
        })
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

async fn read_part(path: &Path, range: PartRange) -> Result<Bytes, StoreError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.offset)).await?;
    let mut buffer = vec![0u8; range.len as usize];
    file.read_exact(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}

#[async_trait]
impl ObjectStore for S3Client {
    #[tracing::instrument(name = "s3.ensure_bucket", skip(self), err)]
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let state = {
            let mut buckets = self.buckets.lock();
            Arc::clone(buckets.entry(bucket.to_string()).or_default())
        };

        state
            .ensured
            .get_or_try_init(|| self.create_bucket_if_missing(bucket, &state))
            .await
            .map(|_| ())
    }

    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, source),
        fields(http.method = "PUT", upload.bytes = tracing::field::Empty),
        err
    )]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: PutSource,
    ) -> Result<String, StoreError> {
        let (body, len) = match source {
            PutSource::Bytes(bytes) => {
                let len = bytes.len() as u64;
                (ByteStream::from(bytes), len)
            }
            PutSource::Path(path) => {
                let len = tokio::fs::metadata(&path).await?.len();
                let body = ByteStream::from_path(&path)
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;
                (body, len)
            }
        };
        tracing::Span::current().record("upload.bytes", len);

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(len as i64)
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        Ok(self.object_url(bucket, key))
    }

    #[tracing::instrument(
        name = "s3.upload_resumable",
        skip(self, options),
        fields(
            local_path = %local_path.display(),
            upload.bytes = tracing::field::Empty,
            s3.upload_id = tracing::field::Empty
        ),
        err
    )]
    async fn upload_resumable(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        options: &ResumableOptions,
    ) -> Result<String, StoreError> {
        let meta = tokio::fs::metadata(local_path).await?;
        let file = FileFingerprint::from_metadata(&meta);
        let part_size = effective_part_size(file.size, options.part_size_bytes());
        let span = tracing::Span::current();
        span.record("upload.bytes", file.size);

        let checkpoints = options
            .checkpoint
            .then(|| CheckpointStore::new(&options.checkpoint_dir));
        let checkpoint_path = checkpoints
            .as_ref()
            .map(|store| store.path_for(bucket, key, local_path));

        let resumed = match (&checkpoints, &checkpoint_path) {
            (Some(store), Some(path)) => match store.load(path).await {
                Some(cp) if cp.matches(bucket, key, &file, part_size) => Some(cp),
                Some(_) => {
                    tracing::info!("Discarding stale checkpoint");
                    store.remove(path).await;
                    None
                }
                None => None,
            },
            _ => None,
        };

        let mut checkpoint = match resumed {
            Some(cp) => {
                tracing::info!(
                    upload_id = %cp.upload_id,
                    acknowledged_parts = cp.parts.len(),
                    acknowledged_bytes = cp.acknowledged_bytes(),
                    "Resuming multipart upload from checkpoint"
                );
                cp
            }
            None => {
                let upload_id = self.create_multipart(bucket, key).await?;
                let cp = UploadCheckpoint::new(bucket, key, upload_id, file, part_size);
                // Recorded before any part so an abandoned upload can still be aborted
                if let (Some(store), Some(path)) = (&checkpoints, &checkpoint_path) {
                    if let Err(e) = store.save(path, &cp).await {
                        tracing::warn!(error = %e, "Failed to write checkpoint");
                    }
                }
                cp
            }
        };
        span.record("s3.upload_id", checkpoint.upload_id.as_str());

        let upload_id = checkpoint.upload_id.clone();
        let pending = checkpoint.pending_parts();
        let mut failure = None;
        {
            let mut parts = stream::iter(pending)
                .map(|range| self.upload_part(bucket, key, &upload_id, local_path, range))
                .buffer_unordered(options.task_num.max(1));

            while let Some(result) = parts.next().await {
                match result {
                    Ok(part) => {
                        checkpoint.record(part);
                        if let (Some(store), Some(path)) = (&checkpoints, &checkpoint_path) {
                            if let Err(e) = store.save(path, &checkpoint).await {
                                tracing::warn!(error = %e, "Failed to write checkpoint");
                            }
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if let Some(e) = failure {
            metrics::record_multipart_upload_failure(bucket);
            if checkpoints.is_none() {
                if let Err(abort) = self.abort_multipart(bucket, key, &upload_id).await {
                    tracing::warn!(
                        upload_id = %upload_id,
                        error = %abort,
                        "Failed to abort multipart upload"
                    );
                }
            }
            return Err(e);
        }

        let completed: Vec<CompletedPart> = checkpoint
            .completed_parts()
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .e_tag(p.etag)
                    .part_number(p.part_number)
                    .build()
            })
            .collect();
        let parts_count = completed.len();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                metrics::record_multipart_upload_failure(bucket);
                classify(e)
            })?;

        if let (Some(store), Some(path)) = (&checkpoints, &checkpoint_path) {
            store.remove(path).await;
        }
        metrics::record_multipart_upload_success(bucket, parts_count);

        let url = match (&self.config.public_base_url, output.location()) {
            (None, Some(location)) if !location.is_empty() => location.to_string(),
            _ => self.object_url(bucket, key),
        };
        tracing::info!(parts = parts_count, url = %url, "Multipart upload completed");
        Ok(url)
    }

    #[tracing::instrument(name = "s3.abandon_resumable", skip(self, options), err)]
    async fn abandon_resumable(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        options: &ResumableOptions,
    ) -> Result<(), StoreError> {
        // Without checkpoints the failed upload was already aborted
        if !options.checkpoint {
            return Ok(());
        }

        let store = CheckpointStore::new(&options.checkpoint_dir);
        let path = store.path_for(bucket, key, local_path);
        let checkpoint = store.load(&path).await;
        store.remove(&path).await;

        match checkpoint {
            Some(cp) => {
                tracing::info!(upload_id = %cp.upload_id, "Abandoning multipart upload");
                self.abort_multipart(bucket, key, &cp.upload_id).await
            }
            None => Ok(()),
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        if let Some(ref base) = self.config.public_base_url {
            return format!("{}/{}", base.trim_end_matches('/'), key);
        }

        match self.config.endpoint {
            Some(ref endpoint) if self.config.force_path_style => {
                format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key)
            }
            Some(ref endpoint) => {
                let endpoint = endpoint.trim_end_matches('/');
                match endpoint.split_once("://") {
                    Some((scheme, host)) => format!("{}://{}.{}/{}", scheme, bucket, host, key),
                    None => format!("{}.{}/{}", bucket, endpoint, key),
                }
            }
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                bucket, self.config.region, key
            ),
        }
    }
}

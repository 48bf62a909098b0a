//! Upload module
//!
//! Per-file upload tasks, the batch orchestrator and zip archive expansion.
//!
//! # Flow
//!
//! 1. [`UploadRequest`]s are staged to local disk ([`staging`])
//! 2. each gets a collision-resistant remote key ([`key`])
//! 3. [`batch::BatchOrchestrator`] runs one [`task::UploadTask`] per request
//!    on the worker pool and collects one [`UploadOutcome`] each
//! 4. zip archives are first exploded into a tree of [`StagedFile`]s
//!    ([`archive`])

pub mod archive;
pub mod batch;
pub mod key;
pub mod staging;
pub mod task;

pub use batch::BatchOrchestrator;
pub use staging::{ReleasePolicy, StagedFile};
pub use task::{TaskSettings, UploadTask};

use crate::pool::PoolError;
use crate::s3::StoreError;
use bytes::Bytes;
use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Failure category of an [`UploadError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    StagingFailed,
    TransferFailed,
    StoreUnavailable,
    ArchiveCorrupt,
    PoolSaturated,
    BatchInterrupted,
    TaskPanicked,
}

impl ErrorKind {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StagingFailed => "staging_failed",
            Self::TransferFailed => "transfer_failed",
            Self::StoreUnavailable => "store_unavailable",
            Self::ArchiveCorrupt => "archive_corrupt",
            Self::PoolSaturated => "pool_saturated",
            Self::BatchInterrupted => "batch_interrupted",
            Self::TaskPanicked => "task_panicked",
        }
    }
}

/// Upload errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Local disk write failed
    #[error("Staging failed for '{name}': {message}")]
    StagingFailed { name: String, message: String },

    /// The store rejected the transfer, or the local file could not be read
    #[error("Transfer failed for '{key}': {error}")]
    TransferFailed {
        key: String,
        #[source]
        error: StoreError,
    },

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("Archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// The pool refused the task
    #[error("Worker pool rejected task: {0}")]
    PoolSaturated(String),

    #[error("Batch interrupted")]
    BatchInterrupted,

    #[error("Upload task panicked: {0}")]
    TaskPanicked(String),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StagingFailed { .. } => ErrorKind::StagingFailed,
            Self::TransferFailed { .. } => ErrorKind::TransferFailed,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::ArchiveCorrupt(_) => ErrorKind::ArchiveCorrupt,
            Self::PoolSaturated(_) => ErrorKind::PoolSaturated,
            Self::BatchInterrupted => ErrorKind::BatchInterrupted,
            Self::TaskPanicked(_) => ErrorKind::TaskPanicked,
        }
    }

    pub fn staging(name: &str, error: impl std::fmt::Display) -> Self {
        Self::StagingFailed {
            name: name.to_string(),
            message: error.to_string(),
        }
    }

    /// Classify a store error raised while transferring `key`
    pub fn from_store(key: &str, error: StoreError) -> Self {
        match error {
            StoreError::Unavailable { .. } | StoreError::ConfigError(_) => {
                Self::StoreUnavailable(error)
            }
            StoreError::Rejected { .. } | StoreError::Io(_) => Self::TransferFailed {
                key: key.to_string(),
                error,
            },
        }
    }
}

impl From<PoolError> for UploadError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Panicked(message) => Self::TaskPanicked(message),
            other => Self::PoolSaturated(other.to_string()),
        }
    }
}

/// Result of one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success { url: String },
    Failure { error: UploadError },
}

impl UploadOutcome {
    pub fn success(url: impl Into<String>) -> Self {
        Self::Success { url: url.into() }
    }

    pub fn failure(error: UploadError) -> Self {
        Self::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Success { url } => Some(url),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&UploadError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error),
        }
    }
}

impl From<Result<String, UploadError>> for UploadOutcome {
    fn from(result: Result<String, UploadError>) -> Self {
        match result {
            Ok(url) => Self::Success { url },
            Err(error) => Self::Failure { error },
        }
    }
}

/// Outcome tagged with the position of its request in the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedOutcome {
    pub index: usize,
    pub outcome: UploadOutcome,
}

/// Sort completion-ordered outcomes back into input order
pub fn into_input_order(mut outcomes: Vec<IndexedOutcome>) -> Vec<UploadOutcome> {
    outcomes.sort_by_key(|o| o.index);
    outcomes.into_iter().map(|o| o.outcome).collect()
}

/// One file to upload: a client-supplied name and a byte stream
pub struct UploadRequest {
    original_name: String,
    content: Box<dyn AsyncRead + Send + Unpin>,
    size: Option<u64>,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("original_name", &self.original_name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl UploadRequest {
    pub fn from_bytes(original_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            original_name: original_name.into(),
            size: Some(data.len() as u64),
            content: Box::new(std::io::Cursor::new(data)),
        }
    }

    /// Open a local file; the request is named after the file
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let original_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            original_name,
            content: Box::new(file),
            size: Some(size),
        })
    }

    pub fn from_reader<R>(original_name: impl Into<String>, reader: R, size: Option<u64>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            original_name: original_name.into(),
            content: Box::new(reader),
            size,
        }
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    /// Declared size, if known up front
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn is_zip(&self) -> bool {
        Path::new(&self.original_name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
    }

    pub fn into_parts(self) -> (String, Box<dyn AsyncRead + Send + Unpin>) {
        (self.original_name, self.content)
    }
}

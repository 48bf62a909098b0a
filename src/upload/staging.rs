//! Local staging of upload content
//!
//! Request bodies are streamed to disk before transfer so resumable uploads
//! can seek and retry parts.
//!
//! [`StagedFile`] is released exactly once: [`StagedFile::release`] consumes
//! it, and dropping an unreleased file with [`ReleasePolicy::Delete`] removes
//! it from disk (RAII). Removal failures are logged, never returned.
//!
//! # Example
//!
//! ```no_run
//! use hakobu::upload::staging::stage_request;
//! use hakobu::upload::UploadRequest;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), hakobu::upload::UploadError> {
//! let request = UploadRequest::from_bytes("hello.txt", "Hello, World!");
//! let staged = stage_request(request, Path::new("/tmp/staging"), "uploads/abc.txt".into()).await?;
//! assert_eq!(staged.size(), 13);
//! staged.release().await;
//! # Ok(())
//! # }
//! ```

use super::{UploadError, UploadRequest};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// What happens to the local file once its upload finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Staged copy owned by the task; deleted on release
    Delete,
    /// Owned by someone else (an extracted archive tree); left in place
    Retain,
}

/// A local file ready for transfer
#[derive(Debug)]
pub struct StagedFile {
    local_path: PathBuf,
    remote_key: String,
    size: u64,
    policy: ReleasePolicy,
    released: bool,
}

impl StagedFile {
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_key: impl Into<String>,
        size: u64,
        policy: ReleasePolicy,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            remote_key: remote_key.into(),
            size,
            policy,
            released: false,
        }
    }

    /// File that outlives its upload
    pub fn retained(local_path: impl Into<PathBuf>, remote_key: impl Into<String>, size: u64) -> Self {
        Self::new(local_path, remote_key, size, ReleasePolicy::Retain)
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_key(&self) -> &str {
        &self.remote_key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn policy(&self) -> ReleasePolicy {
        self.policy
    }

    /// Release the file according to its policy
    pub async fn release(mut self) {
        self.released = true;
        if self.policy == ReleasePolicy::Delete {
            log_removal(&self.local_path, tokio::fs::remove_file(&self.local_path).await);
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.released && self.policy == ReleasePolicy::Delete {
            log_removal(&self.local_path, std::fs::remove_file(&self.local_path));
        }
    }
}

fn log_removal(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "Staged file removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged file");
        }
    }
}

/// Stream `request` into `staging_dir`, named after the last segment of
/// `remote_key`. A partially written file is removed on error.
pub async fn stage_request(
    request: UploadRequest,
    staging_dir: &Path,
    remote_key: String,
) -> Result<StagedFile, UploadError> {
    let (name, mut content) = request.into_parts();

    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(|e| UploadError::staging(&name, e))?;

    let file_name = remote_key
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| UploadError::staging(&name, "remote key has no file name"))?;
    let path = staging_dir.join(file_name);

    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| UploadError::staging(&name, e))?;

    // From here on, dropping `staged` removes the partial file
    let mut staged = StagedFile::new(path, remote_key, 0, ReleasePolicy::Delete);

    let written = tokio::io::copy(&mut content, &mut file)
        .await
        .map_err(|e| UploadError::staging(&name, e))?;
    file.flush().await.map_err(|e| UploadError::staging(&name, e))?;

    staged.size = written;
    tracing::debug!(
        file = %name,
        path = %staged.local_path.display(),
        bytes = written,
        "Request staged"
    );
    Ok(staged)
}

//! Hakobu Library
//!
//! Concurrent batch uploader for S3-compatible object storage.
//!
//! # Features
//!
//! - **Bounded Concurrency**: worker pool with core/max sizing and a bounded backlog
//! - **Resumable**: chunked multipart uploads with on-disk checkpoints
//! - **Failure Isolation**: one outcome per file, a failed file never sinks its batch
//! - **Archives**: zip uploads (UTF-8 or GBK names) are exploded into one object per file
//!
//! # Example
//!
//! ```no_run
//! use hakobu::{config::Config, s3::{S3Client, S3ClientConfig}, Uploader, UploadRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let store = Arc::new(S3Client::connect(S3ClientConfig::from(&config.store)).await?);
//!     let uploader = Uploader::new(&config, store)?;
//!
//!     let requests = vec![
//!         UploadRequest::from_bytes("hello.txt", "Hello"),
//!         UploadRequest::from_path("banner.png").await?,
//!     ];
//!     for outcome in uploader.upload_concurrent_batch(requests).await {
//!         println!("{:?}", outcome);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod s3;
pub mod service;
pub mod timing;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use service::Uploader;
pub use upload::{ErrorKind, UploadError, UploadOutcome, UploadRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

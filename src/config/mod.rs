//! Configuration module for Hakobu
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Smallest part size accepted for resumable uploads (100 KiB)
pub const MIN_PART_SIZE: usize = 100 * 1024;

/// Smallest non-final part AWS S3 and MinIO accept (5 MiB)
pub const DEFAULT_STORE_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Upper bound on `pool.max_size`
pub const MAX_POOL_SIZE: usize = 1024;

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Build a configuration with defaults for everything but the store
    pub fn with_store(store: StoreConfig) -> Self {
        Self {
            store,
            pool: PoolConfig::default(),
            upload: UploadConfig::default(),
            archive: ArchiveConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "store.bucket must not be empty".into(),
            ));
        }

        if let Some(ref endpoint) = self.store.endpoint {
            if !is_valid_http_url(endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid store endpoint '{}': must start with http:// or https://",
                    endpoint
                )));
            }
        }

        if let Some(ref base) = self.store.public_base_url {
            if !is_valid_http_url(base) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid public_base_url '{}': must start with http:// or https://",
                    base
                )));
            }
        }

        if self.store.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "store.retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.pool.core_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool.core_size must be at least 1".into(),
            ));
        }

        if self.pool.max_size > MAX_POOL_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "pool.max_size ({}) must not exceed {}",
                self.pool.max_size, MAX_POOL_SIZE
            )));
        }

        if self.pool.core_size > self.pool.max_size {
            return Err(ConfigError::ValidationError(format!(
                "pool.core_size ({}) must not exceed pool.max_size ({})",
                self.pool.core_size, self.pool.max_size
            )));
        }

        if self.upload.part_size < MIN_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "upload.part_size {} is below the minimum of {} bytes",
                self.upload.part_size, MIN_PART_SIZE
            )));
        }

        if self.store.min_part_size < MIN_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "store.min_part_size {} is below the minimum of {} bytes",
                self.store.min_part_size, MIN_PART_SIZE
            )));
        }

        if self.upload.resume_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "upload.resume_attempts must be at least 1".into(),
            ));
        }

        if self.upload.task_num == 0 {
            return Err(ConfigError::ValidationError(
                "upload.task_num must be at least 1".into(),
            ));
        }

        if encoding_rs::Encoding::for_label(self.archive.default_encoding.as_bytes()).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "Unknown archive encoding '{}'",
                self.archive.default_encoding
            )));
        }

        if self.metrics.enabled && self.metrics.address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid metrics address '{}'",
                self.metrics.address
            )));
        }

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid logging format '{}': must be 'json' or 'pretty'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Object store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Base for returned object URLs, e.g. `https://cdn.example.com`
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    /// Smallest non-final multipart part the endpoint accepts. 5 MiB for AWS
    /// S3 and MinIO; OSS-style endpoints take 100 KiB.
    #[serde(default = "default_min_part_size")]
    pub min_part_size: usize,
}

impl StoreConfig {
    /// Store configuration for a bucket with every optional field unset
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: default_region(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            public_base_url: None,
            force_path_style: default_force_path_style(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            min_part_size: default_min_part_size(),
        }
    }
}

fn default_min_part_size() -> usize {
    DEFAULT_STORE_MIN_PART_SIZE
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

/// Retry policy for store requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// Timeouts for store requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_operation_secs")]
    pub operation_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_secs: default_operation_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn operation(&self) -> Duration {
        Duration::from_secs(self.operation_secs)
    }
}

fn default_operation_secs() -> u64 {
    300
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_core_size")]
    pub core_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Idle time after which burst workers above `core_size` retire
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: default_core_size(),
            max_size: default_max_size(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Backlog capacity, twice the maximum worker count
    pub fn backlog_capacity(&self) -> usize {
        self.max_size.saturating_mul(2).max(1)
    }
}

fn default_core_size() -> usize {
    4
}

fn default_max_size() -> usize {
    8
}

fn default_keep_alive_secs() -> u64 {
    60_000 // 1000 minutes
}

/// Staging and transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
    /// Key prefix for direct uploads, also the staging subdirectory
    #[serde(default = "default_context_path")]
    pub context_path: String,
    #[serde(default = "default_part_size")]
    pub part_size: usize,
    /// Parts transferred concurrently within one resumable upload
    #[serde(default = "default_task_num")]
    pub task_num: usize,
    #[serde(default = "default_checkpoint")]
    pub checkpoint: bool,
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Attempts per resumable upload; later attempts resume from the checkpoint
    #[serde(default = "default_resume_attempts")]
    pub resume_attempts: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            staging_root: default_staging_root(),
            context_path: default_context_path(),
            part_size: default_part_size(),
            task_num: default_task_num(),
            checkpoint: default_checkpoint(),
            checkpoint_dir: None,
            resume_attempts: default_resume_attempts(),
        }
    }
}

impl UploadConfig {
    /// Directory holding resumable-upload checkpoints
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.staging_root.join(".checkpoints"))
    }
}

fn default_resume_attempts() -> usize {
    3
}

fn default_staging_root() -> PathBuf {
    std::env::temp_dir().join("hakobu-staging")
}

fn default_context_path() -> String {
    "uploads/".to_string()
}

fn default_part_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_task_num() -> usize {
    5
}

fn default_checkpoint() -> bool {
    true
}

/// Zip archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Encoding label for entry names, e.g. "utf-8" or "gbk"
    #[serde(default = "default_encoding")]
    pub default_encoding: String,
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            default_encoding: default_encoding(),
            scratch_root: None,
        }
    }
}

impl ArchiveConfig {
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::with_store(StoreConfig::new("uploads"))
    }

    #[test]
    fn test_default_upload_config() {
        let config = UploadConfig::default();
        assert_eq!(config.part_size, 1024 * 1024);
        assert_eq!(config.task_num, 5);
        assert!(config.checkpoint);
        assert_eq!(
            config.checkpoint_dir(),
            config.staging_root.join(".checkpoints")
        );
    }

    #[test]
    fn test_backlog_is_twice_max_size() {
        let config = PoolConfig {
            core_size: 2,
            max_size: 5,
            keep_alive_secs: 1,
        };
        assert_eq!(config.backlog_capacity(), 10);
    }

    #[test]
    fn test_config_validation_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_caps_pool_size() {
        let mut config = valid_config();
        config.pool.max_size = usize::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool.max_size"));

        config.pool.max_size = MAX_POOL_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_min_part_size_and_attempts() {
        let mut config = valid_config();
        assert_eq!(config.store.min_part_size, DEFAULT_STORE_MIN_PART_SIZE);

        config.store.min_part_size = MIN_PART_SIZE;
        assert!(config.validate().is_ok());

        config.store.min_part_size = 1024;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.upload.resume_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_bucket() {
        let config = Config::with_store(StoreConfig::new("  "));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_core_above_max() {
        let mut config = valid_config();
        config.pool.core_size = 10;
        config.pool.max_size = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_small_part_size() {
        let mut config = valid_config();
        config.upload.part_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_unknown_encoding() {
        let mut config = valid_config();
        config.archive.default_encoding = "klingon".into();
        assert!(config.validate().is_err());

        config.archive.default_encoding = "gbk".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_bad_endpoint() {
        let mut config = valid_config();
        config.store.endpoint = Some("localhost:9000".into());
        assert!(config.validate().is_err());
    }
}

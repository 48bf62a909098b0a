//! Hakobu - concurrent batch uploader for S3-compatible object storage
//!
//! Prints one line per uploaded file: the object URL, or `FAILED: <error>`.
//! Exits with status 1 if any file failed.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hakobu::config::Config;
use hakobu::s3::{self, ObjectStore, S3Client, S3ClientConfig};
use hakobu::upload::{into_input_order, IndexedOutcome, UploadError};
use hakobu::{logging, UploadOutcome, UploadRequest, Uploader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Hakobu - concurrent batch uploader for S3-compatible object storage
#[derive(Parser, Debug)]
#[command(name = "hakobu")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload files as one batch
    Upload {
        /// Upload one file at a time instead of using the worker pool
        #[arg(long)]
        sequential: bool,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Expand a zip archive and upload every file in it
    Archive {
        zip: PathBuf,

        /// Entry name encoding, e.g. utf-8 or gbk
        #[arg(long)]
        encoding: Option<String>,

        /// Key prefix for the extracted files
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Load and validate the configuration, then exit
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    if let Command::Validate = args.command {
        println!(
            "Configuration OK: bucket '{}', pool {}..{} workers",
            config.store.bucket, config.pool.core_size, config.pool.max_size
        );
        return Ok(());
    }

    logging::init_logging(&config.logging, args.log_level.as_deref())?;
    info!("Starting Hakobu v{}", hakobu::VERSION);

    #[cfg(feature = "metrics")]
    let mut metrics_server = hakobu::metrics::server::MetricsServer::from_config(&config.metrics);
    #[cfg(feature = "metrics")]
    {
        if let Some(server) = metrics_server.as_mut() {
            server.start().await?;
        }
    }

    let client = S3Client::connect(S3ClientConfig::from(&config.store)).await?;
    let store: Arc<dyn ObjectStore> = s3::shared::install(client);
    let uploader = Uploader::new(&config, store)?;

    let outcomes = match args.command {
        Command::Upload { sequential, files } => upload_files(&uploader, files, sequential).await,
        Command::Archive {
            zip,
            encoding,
            prefix,
        } => {
            let file = tokio::fs::File::open(&zip)
                .await
                .with_context(|| format!("failed to open {}", zip.display()))?;
            uploader
                .upload_archive(file, encoding.as_deref(), &prefix)
                .await?
        }
        Command::Validate => unreachable!("validate returns before the store is set up"),
    };

    let failed = report(&outcomes);
    info!(total = outcomes.len(), failed, stats = ?uploader.pool_stats(), "Done");

    #[cfg(feature = "metrics")]
    {
        if let Some(server) = metrics_server.as_mut() {
            server.shutdown().await;
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Open every path and upload the ones that opened. Paths that could not be
/// opened keep their slot as a staging failure.
async fn upload_files(uploader: &Uploader, files: Vec<PathBuf>, sequential: bool) -> Vec<UploadOutcome> {
    let mut opened = Vec::new();
    let mut positions = Vec::new();
    let mut outcomes = Vec::with_capacity(files.len());

    for (index, path) in files.iter().enumerate() {
        match UploadRequest::from_path(path).await {
            Ok(request) => {
                positions.push(index);
                opened.push(request);
            }
            Err(e) => outcomes.push(IndexedOutcome {
                index,
                outcome: UploadOutcome::failure(UploadError::staging(&path.display().to_string(), e)),
            }),
        }
    }

    let uploaded = if sequential {
        uploader.upload_single_batch(opened).await
    } else {
        uploader.upload_concurrent_batch(opened).await
    };

    outcomes.extend(
        positions
            .into_iter()
            .zip(uploaded)
            .map(|(index, outcome)| IndexedOutcome { index, outcome }),
    );
    into_input_order(outcomes)
}

fn report(outcomes: &[UploadOutcome]) -> usize {
    let mut failed = 0;
    for outcome in outcomes {
        match outcome {
            UploadOutcome::Success { url } => println!("{url}"),
            UploadOutcome::Failure { error } => {
                failed += 1;
                println!("FAILED: {error}");
            }
        }
    }
    failed
}

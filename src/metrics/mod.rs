//! Metrics module
//!
//! Prometheus metrics for uploads, batches, the worker pool and archive
//! expansion. Exposed over HTTP by [`server::MetricsServer`].

#[cfg(feature = "metrics")]
pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec,
    register_int_gauge, Counter, CounterVec, Histogram, HistogramVec, IntGauge,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "hakobu_uploads_total",
        "Total number of uploaded objects",
        &["bucket", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "hakobu_upload_bytes_total",
        "Total bytes uploaded"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "hakobu_upload_duration_seconds",
        "Per-object upload duration in seconds",
        &["bucket", "method"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_UPLOADS: CounterVec = register_counter_vec!(
        "hakobu_multipart_uploads_total",
        "Total multipart uploads",
        &["bucket", "status"]
    ).unwrap();

    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "hakobu_multipart_parts",
        "Number of parts per multipart upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    // Batch metrics
    pub static ref BATCH_DURATION: HistogramVec = register_histogram_vec!(
        "hakobu_batch_duration_seconds",
        "Batch duration in seconds",
        &["mode"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    pub static ref BATCH_SIZE: Histogram = register_histogram!(
        "hakobu_batch_size",
        "Requests per batch",
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 500.0]
    ).unwrap();

    // Pool gauges
    pub static ref POOL_ACTIVE: IntGauge = register_int_gauge!(
        "hakobu_pool_active_tasks",
        "Tasks currently running on the worker pool"
    ).unwrap();

    pub static ref POOL_QUEUED: IntGauge = register_int_gauge!(
        "hakobu_pool_queued_tasks",
        "Tasks waiting in the worker pool backlog"
    ).unwrap();

    pub static ref POOL_WORKERS: IntGauge = register_int_gauge!(
        "hakobu_pool_workers",
        "Live worker pool workers"
    ).unwrap();

    // Archive metrics
    pub static ref ARCHIVE_ENTRIES: Histogram = register_histogram!(
        "hakobu_archive_entries",
        "Files extracted per archive",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "hakobu_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a successful upload
pub fn record_upload_success(bucket: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[bucket, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed upload
pub fn record_upload_failure(bucket: &str) {
    UPLOADS_TOTAL.with_label_values(&[bucket, "failure"]).inc();
}

/// Record upload duration
pub fn record_upload_duration(bucket: &str, method: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[bucket, method])
        .observe(duration_secs);
}

/// Record a successful multipart upload
pub fn record_multipart_upload_success(bucket: &str, parts_count: usize) {
    MULTIPART_UPLOADS
        .with_label_values(&[bucket, "success"])
        .inc();
    MULTIPART_PARTS.observe(parts_count as f64);
}

/// Record a failed multipart upload
pub fn record_multipart_upload_failure(bucket: &str) {
    MULTIPART_UPLOADS
        .with_label_values(&[bucket, "failure"])
        .inc();
}

/// Record the number of requests in a batch
pub fn record_batch_size(size: usize) {
    BATCH_SIZE.observe(size as f64);
}

/// Record a labelled duration, e.g. from [`crate::timing::timed`]
pub fn record_duration(label: &str, duration_secs: f64) {
    BATCH_DURATION.with_label_values(&[label]).observe(duration_secs);
}

/// Publish a pool snapshot
pub fn record_pool_state(workers: usize, active: usize, queued: usize) {
    POOL_WORKERS.set(workers as i64);
    POOL_ACTIVE.set(active as i64);
    POOL_QUEUED.set(queued as i64);
}

/// Record the number of files extracted from one archive
pub fn record_archive_entries(count: usize) {
    ARCHIVE_ENTRIES.observe(count as f64);
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

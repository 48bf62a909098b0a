//! Duration measurement hook
//!
//! Wraps a future, logs its wall time and records it in the
//! `hakobu_batch_duration_seconds` histogram under `label`. Purely
//! observational: the output is passed through untouched.

use crate::metrics;
use std::future::Future;
use std::time::Instant;

pub async fn timed<F>(label: &'static str, fut: F) -> F::Output
where
    F: Future,
{
    let started = Instant::now();
    let output = fut.await;
    let elapsed = started.elapsed();

    tracing::info!(
        label,
        elapsed_ms = elapsed.as_millis() as u64,
        "Timed operation finished"
    );
    metrics::record_duration(label, elapsed.as_secs_f64());
    output
}

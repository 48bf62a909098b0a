//! Batch orchestration
//!
//! One [`UploadTask`] per input is submitted to the shared [`WorkerPool`];
//! results are collected through `FuturesUnordered` as they finish, so the
//! batch always yields exactly one outcome per input. A task that fails,
//! panics or is refused by the pool fills its slot with a failure.

use super::staging::StagedFile;
use super::task::{TaskSettings, UploadTask};
use super::{into_input_order, IndexedOutcome, UploadError, UploadOutcome, UploadRequest};
use crate::metrics;
use crate::pool::WorkerPool;
use crate::s3::ObjectStore;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fans batches out onto the worker pool
#[derive(Clone)]
pub struct BatchOrchestrator {
    pool: Arc<WorkerPool>,
    store: Arc<dyn ObjectStore>,
    settings: Arc<TaskSettings>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("pool", &self.pool)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BatchOrchestrator {
    pub fn new(
        pool: Arc<WorkerPool>,
        store: Arc<dyn ObjectStore>,
        settings: Arc<TaskSettings>,
    ) -> Self {
        Self {
            pool,
            store,
            settings,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Upload every request concurrently; outcomes in input order
    pub async fn run_batch(&self, requests: Vec<UploadRequest>) -> Vec<UploadOutcome> {
        let tasks = self.staged_tasks(requests);
        self.run_uncancelled(tasks).await
    }

    /// Upload every request concurrently; outcomes in completion order.
    ///
    /// If `cancel` fires before all outcomes are in, returns
    /// [`UploadError::BatchInterrupted`]. Tasks already handed to the pool
    /// keep running.
    pub async fn run_batch_indexed(
        &self,
        requests: Vec<UploadRequest>,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexedOutcome>, UploadError> {
        let tasks = self.staged_tasks(requests);
        self.dispatch(tasks, cancel).await
    }

    /// Upload files already on disk (archive leaves); outcomes in input order
    pub async fn run_prestaged(&self, files: Vec<StagedFile>) -> Vec<UploadOutcome> {
        let tasks = files
            .into_iter()
            .map(|file| UploadTask::prestaged(file, Arc::clone(&self.settings)))
            .collect();
        self.run_uncancelled(tasks).await
    }

    /// Upload one request after another on the calling task, without the pool
    pub async fn run_sequential(&self, requests: Vec<UploadRequest>) -> Vec<UploadOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for task in self.staged_tasks(requests) {
            outcomes.push(task.run(Arc::clone(&self.store)).await);
        }
        outcomes
    }

    fn staged_tasks(&self, requests: Vec<UploadRequest>) -> Vec<UploadTask> {
        requests
            .into_iter()
            .map(|request| UploadTask::staged(request, Arc::clone(&self.settings)))
            .collect()
    }

    async fn run_uncancelled(&self, tasks: Vec<UploadTask>) -> Vec<UploadOutcome> {
        let total = tasks.len();
        match self.dispatch(tasks, &CancellationToken::new()).await {
            Ok(outcomes) => into_input_order(outcomes),
            // Unreachable with a fresh token; still one slot per input
            Err(error) => (0..total)
                .map(|_| UploadOutcome::failure(error.clone()))
                .collect(),
        }
    }

    async fn dispatch(
        &self,
        tasks: Vec<UploadTask>,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexedOutcome>, UploadError> {
        let total = tasks.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        metrics::record_batch_size(total);
        tracing::info!(tasks = total, "Dispatching batch");

        let mut outcomes = Vec::with_capacity(total);
        let mut pending = FuturesUnordered::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let store = Arc::clone(&self.store);
            let submitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(interrupted(outcomes.len(), total)),
                submitted = self.pool.submit(task.run(store)) => submitted,
            };

            match submitted {
                Ok(handle) => pending.push(async move { (index, handle.await) }),
                Err(e) => {
                    tracing::warn!(index, error = %e, "Pool refused upload task");
                    outcomes.push(IndexedOutcome {
                        index,
                        outcome: UploadOutcome::failure(e.into()),
                    });
                }
            }
        }

        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(interrupted(outcomes.len(), total)),
                Some((index, result)) = pending.next() => {
                    let outcome = result.unwrap_or_else(|e| UploadOutcome::failure(e.into()));
                    outcomes.push(IndexedOutcome { index, outcome });
                }
            }
        }

        let failed = outcomes.iter().filter(|o| !o.outcome.is_success()).count();
        tracing::info!(tasks = total, failed, "Batch finished");
        Ok(outcomes)
    }
}

fn interrupted(collected: usize, total: usize) -> UploadError {
    tracing::warn!(collected, total, "Batch interrupted while collecting outcomes");
    metrics::record_error("batch_interrupted");
    UploadError::BatchInterrupted
}

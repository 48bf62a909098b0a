//! Bounded worker pool
//!
//! A fixed set of long-lived tokio tasks (`core_size`) pulls jobs from a
//! bounded FIFO backlog. When the backlog is full the pool grows with burst
//! workers up to `max_size`; burst workers retire after `keep_alive` idle.
//! Past that, [`WorkerPool::submit`] waits for backlog space and
//! [`WorkerPool::try_submit`] fails with [`PoolError::Saturated`].
//!
//! Workers never keep the runtime alive and never need joining. Dropping the
//! pool (or calling [`WorkerPool::shutdown`]) closes the backlog; workers
//! drain what is queued and exit.
//!
//! # Example
//!
//! ```
//! use hakobu::pool::WorkerPool;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), hakobu::pool::PoolError> {
//! let pool = WorkerPool::new(2, 4, Duration::from_secs(60))?;
//! let handle = pool.submit(async { 21 * 2 }).await?;
//! assert_eq!(handle.await?, 42);
//! # Ok(())
//! # }
//! ```

use crate::config::{PoolConfig, MAX_POOL_SIZE};
use crate::metrics;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Job as stored in the backlog. Resolves to `true` if the job panicked.
type Job = Pin<Box<dyn Future<Output = bool> + Send + 'static>>;

/// Pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Backlog full and all `max_size` workers busy
    #[error("Worker pool saturated")]
    Saturated,

    #[error("Worker pool is shut down")]
    Closed,

    #[error("Task panicked: {0}")]
    Panicked(String),
}

/// Snapshot of the pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub active: usize,
    pub queued: usize,
    /// Highest `active` seen since the pool was created
    pub peak_active: usize,
    pub completed: usize,
    pub panicked: usize,
}

/// State shared between the pool handle and its workers.
///
/// Workers never hold the backlog sender, so dropping the pool closes the
/// channel and lets them exit.
struct Shared {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    core_size: usize,
    keep_alive: Duration,
    workers: AtomicUsize,
    active: AtomicUsize,
    queued: AtomicUsize,
    peak_active: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
}

impl Shared {
    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            peak_active: self.peak_active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            panicked: self.panicked.load(Ordering::SeqCst),
        }
    }

    fn publish(&self) {
        let stats = self.stats();
        metrics::record_pool_state(stats.workers, stats.active, stats.queued);
    }

    /// Reserve a worker slot if fewer than `limit` workers exist
    fn reserve_worker(&self, limit: usize) -> bool {
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give up a worker slot if the pool is above `core_size`
    fn try_retire(&self) -> bool {
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > self.core_size).then(|| n - 1)
            })
            .is_ok()
    }

    async fn run_job(&self, job: Job) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        self.publish();

        if job.await {
            self.panicked.fetch_add(1, Ordering::SeqCst);
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.publish();
    }
}

async fn worker_loop(shared: Arc<Shared>, first: Option<Job>) {
    if let Some(job) = first {
        shared.run_job(job).await;
    }

    loop {
        let next = tokio::time::timeout(shared.keep_alive, async {
            shared.receiver.lock().await.recv().await
        })
        .await;

        match next {
            Ok(Some(job)) => {
                shared.queued.fetch_sub(1, Ordering::SeqCst);
                shared.run_job(job).await;
            }
            // Backlog closed and drained
            Ok(None) => break,
            Err(_idle) => {
                if shared.try_retire() {
                    tracing::debug!("Burst worker retired after keep-alive");
                    shared.publish();
                    return;
                }
            }
        }
    }

    shared.workers.fetch_sub(1, Ordering::SeqCst);
    shared.publish();
}

/// Handle on a submitted job's result
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, PoolError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PoolError::Closed)))
    }
}

/// Bounded worker pool, shared across batches
pub struct WorkerPool {
    max_size: usize,
    backlog: usize,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("core_size", &self.shared.core_size)
            .field("max_size", &self.max_size)
            .field("backlog", &self.backlog)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool with a backlog of `2 × max_size`. No workers are started
    /// until the first submission.
    pub fn new(core_size: usize, max_size: usize, keep_alive: Duration) -> Result<Self, PoolError> {
        if core_size == 0 || core_size > max_size {
            return Err(PoolError::InvalidConfig(format!(
                "need 1 <= core_size ({}) <= max_size ({})",
                core_size, max_size
            )));
        }
        if max_size > MAX_POOL_SIZE {
            return Err(PoolError::InvalidConfig(format!(
                "max_size ({}) exceeds {}",
                max_size, MAX_POOL_SIZE
            )));
        }

        let backlog = max_size.saturating_mul(2);
        let (sender, receiver) = mpsc::channel(backlog);

        Ok(Self {
            max_size,
            backlog,
            sender: Mutex::new(Some(sender)),
            shared: Arc::new(Shared {
                receiver: tokio::sync::Mutex::new(receiver),
                core_size,
                keep_alive,
                workers: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                peak_active: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                panicked: AtomicUsize::new(0),
            }),
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        Self::new(config.core_size, config.max_size, config.keep_alive())
    }

    pub fn core_size(&self) -> usize {
        self.shared.core_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn backlog_capacity(&self) -> usize {
        self.backlog
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Submit a job, waiting for backlog space when the pool is saturated
    pub async fn submit<F, T>(&self, fut: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = wrap(fut);
        let sender = self.sender()?;

        let job = match self.offer(&sender, job)? {
            None => return Ok(handle),
            Some(job) => job,
        };

        tracing::debug!("Worker pool saturated, waiting for backlog space");
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if sender.send(job).await.is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Closed);
        }
        self.shared.publish();
        Ok(handle)
    }

    /// Submit a job without waiting; fails with [`PoolError::Saturated`] when
    /// the backlog is full and no more workers may start.
    ///
    /// Must be called from within a tokio runtime.
    pub fn try_submit<F, T>(&self, fut: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = wrap(fut);
        let sender = self.sender()?;

        match self.offer(&sender, job)? {
            None => Ok(handle),
            Some(_rejected) => {
                metrics::record_error("pool_saturated");
                Err(PoolError::Saturated)
            }
        }
    }

    /// Close the backlog. Queued jobs still run; later submissions fail with
    /// [`PoolError::Closed`].
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            tracing::info!(stats = ?self.stats(), "Worker pool shut down");
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, PoolError> {
        self.sender.lock().clone().ok_or(PoolError::Closed)
    }

    /// Core worker, then backlog, then burst worker. Hands the job back if
    /// none of them can take it.
    fn offer(&self, sender: &mpsc::Sender<Job>, job: Job) -> Result<Option<Job>, PoolError> {
        if self.shared.reserve_worker(self.shared.core_size) {
            self.spawn_worker(job);
            return Ok(None);
        }

        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(job) {
            Ok(()) => {
                self.shared.publish();
                Ok(None)
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                if self.shared.reserve_worker(self.max_size) {
                    tracing::debug!("Backlog full, starting burst worker");
                    self.spawn_worker(job);
                    Ok(None)
                } else {
                    Ok(Some(job))
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                Err(PoolError::Closed)
            }
        }
    }

    fn spawn_worker(&self, first: Job) {
        tokio::spawn(worker_loop(Arc::clone(&self.shared), Some(first)));
        self.shared.publish();
    }
}

fn wrap<F, T>(fut: F) -> (Job, TaskHandle<T>)
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::pin(async move {
        let result = AssertUnwindSafe(fut).catch_unwind().await;
        let panicked = result.is_err();
        let result = result.map_err(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "Pool task panicked");
            PoolError::Panicked(message)
        });
        // Receiver gone means nobody is waiting for the result
        let _ = tx.send(result);
        panicked
    });
    (job, TaskHandle { rx })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

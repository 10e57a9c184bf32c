//! Dedicated OS worker threads for blocking or CPU-heavy task sections.
//!
//! Task bodies are async and run on the runtime alongside the scheduler's own
//! admission path. Work that would block that runtime is handed to this pool
//! through [`TaskContext::run_blocking`](crate::core::TaskContext::run_blocking).
//!
//! # Design Principles
//!
//! - **No polling**: Workers block on a bounded channel; results come back over oneshot
//! - **Bounded**: A full queue is reported to the caller instead of growing without limit
//! - **Clean shutdown**: Dropping the sender unblocks idle workers naturally

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::WorkerPoolConfig;
use crate::core::error::panic_message;
use crate::core::SchedulerError;

/// A queued job. Returns whether the wrapped closure panicked.
type Job = Box<dyn FnOnce() -> bool + Send + 'static>;

/// Statistics about worker utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Jobs currently executing.
    pub active_jobs: u64,
    /// Jobs waiting in the channel.
    pub queued_jobs: u64,
    /// Jobs that returned normally.
    pub completed_jobs: u64,
    /// Jobs that panicked.
    pub panicked_jobs: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
struct PoolCounters {
    active_jobs: AtomicU64,
    queued_jobs: AtomicU64,
    completed_jobs: AtomicU64,
    panicked_jobs: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self, worker_count: usize) -> WorkerPoolStats {
        WorkerPoolStats {
            worker_count,
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            completed_jobs: self.completed_jobs.load(Ordering::Relaxed),
            panicked_jobs: self.panicked_jobs.load(Ordering::Relaxed),
        }
    }
}

/// Bounded pool of dedicated OS threads.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Job sender. `None` once shut down so idle workers see a closed channel.
    job_tx: Mutex<Option<Sender<Job>>>,
    counters: Arc<PoolCounters>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` worker threads.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for an invalid configuration and
    /// `SchedulerError::Runtime` if a thread cannot be spawned.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let (job_tx, job_rx) = bounded::<Job>(config.max_queue_depth);
        let counters = Arc::new(PoolCounters::default());

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = spawn_worker(
                worker_id,
                job_rx.clone(),
                Arc::clone(&counters),
                config.thread_stack_size,
            )
            .map_err(|e| SchedulerError::Runtime(format!("failed to spawn worker thread: {e}")))?;
            workers.push(worker);
        }

        info!(
            worker_count = config.worker_count,
            max_queue_depth = config.max_queue_depth,
            "worker pool initialized"
        );

        Ok(Self {
            config,
            job_tx: Mutex::new(Some(job_tx)),
            counters,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(workers),
        })
    }

    /// Run `f` on a worker thread and await its return value.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::WorkerQueueFull` if the job queue is full
    /// - `SchedulerError::WorkerPoolShutdown` if the pool has been shut down
    /// - `SchedulerError::WorkerPanicked` if `f` panics
    pub async fn run<F, R>(&self, f: F) -> Result<R, SchedulerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.submit(Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            let panicked = outcome.is_err();
            // The awaiting body may have been dropped; nothing to deliver then.
            let _ = result_tx.send(outcome);
            panicked
        }))?;

        match result_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(SchedulerError::WorkerPanicked(panic_message(payload.as_ref()))),
            Err(_) => Err(SchedulerError::WorkerPoolShutdown),
        }
    }

    fn submit(&self, job: Job) -> Result<(), SchedulerError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::WorkerPoolShutdown);
        }
        let job_tx = self.job_tx.lock();
        let Some(job_tx) = job_tx.as_ref() else {
            return Err(SchedulerError::WorkerPoolShutdown);
        };
        match job_tx.try_send(job) {
            Ok(()) => {
                self.counters.queued_jobs.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!("worker pool queue is full");
                Err(SchedulerError::WorkerQueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(SchedulerError::WorkerPoolShutdown),
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> WorkerPoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    /// Whether [`WorkerPool::shutdown`] has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting jobs and join every worker.
    ///
    /// Queued jobs still run before their worker exits. A worker that does not
    /// exit within `config.join_timeout()` is detached with a warning. Blocks the
    /// calling thread; call it from `spawn_blocking` inside async code.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("shutting down worker pool");
        self.job_tx.lock().take();

        let mut workers = self.workers.lock();
        let worker_count = workers.len();
        for (idx, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = std::sync::mpsc::channel();
            let join_thread = thread::spawn(move || {
                let result = worker.join();
                let _ = tx.send(result.is_ok());
            });

            match rx.recv_timeout(self.config.join_timeout()) {
                Ok(true) => debug!(worker_id = idx, "worker joined"),
                Ok(false) => warn!(worker_id = idx, "worker panicked"),
                Err(_) => {
                    warn!(worker_id = idx, "worker did not exit within timeout - detaching");
                    // Leave the joiner running; the worker exits once its job returns.
                    continue;
                }
            }
            let _ = join_thread.join();
        }

        info!(worker_count = worker_count, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal only; joining in Drop could hang on a long-running job.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.job_tx.lock().take();
            debug!("worker pool dropped without explicit shutdown - workers detached");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn spawn_worker(
    worker_id: usize,
    job_rx: Receiver<Job>,
    counters: Arc<PoolCounters>,
    stack_size: usize,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("scheduler-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(worker_id = worker_id, "worker thread started");
            // `recv` fails once every sender is gone, which is the exit signal.
            while let Ok(job) = job_rx.recv() {
                counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                counters.active_jobs.fetch_add(1, Ordering::Relaxed);
                let panicked = job();
                counters.active_jobs.fetch_sub(1, Ordering::Relaxed);
                if panicked {
                    counters.panicked_jobs.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.completed_jobs.fetch_add(1, Ordering::Relaxed);
                }
            }
            debug!(worker_id = worker_id, "worker thread exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(workers: usize, depth: usize) -> WorkerPool {
        WorkerPool::new(
            WorkerPoolConfig::new()
                .with_worker_count(workers)
                .with_max_queue_depth(depth),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_returns_value_from_worker_thread() {
        let pool = pool(2, 8);
        let name = pool
            .run(|| thread::current().name().map(str::to_string))
            .await
            .unwrap();
        assert!(name.unwrap().starts_with("scheduler-worker-"));
        pool.shutdown();
        assert_eq!(pool.stats().completed_jobs, 1);
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported() {
        let pool = pool(1, 4);
        let err = pool.run(|| -> u32 { panic!("boom") }).await.unwrap_err();
        match err {
            SchedulerError::WorkerPanicked(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected error: {other}"),
        }
        // The worker survives the panic.
        assert_eq!(pool.run(|| 7).await.unwrap(), 7);
        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.panicked_jobs, 1);
        assert_eq!(stats.completed_jobs, 1);
    }

    #[tokio::test]
    async fn test_run_after_shutdown_fails() {
        let pool = pool(1, 4);
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(matches!(
            pool.run(|| 1).await,
            Err(SchedulerError::WorkerPoolShutdown)
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(0));
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }
}

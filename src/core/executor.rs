//! Task execution traits and the context handed to a running body.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::task::TaskControl;
use crate::core::worker_pool::WorkerPool;
use crate::core::{AppResult, SchedulerError};
use crate::util::serde::{ResourceKind, TaskId};

/// An executable task body.
///
/// The scheduler calls [`TaskBody::run`] exactly once, after the task has been
/// admitted and its resources granted. The returned value becomes the task
/// result; an error marks the task failed with the error's description.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_scheduler::core::{AppResult, TaskBody, TaskContext};
/// use prometheus_scheduler::util::ResourceKind;
///
/// struct Summarize {
///     documents: Vec<String>,
/// }
///
/// #[async_trait]
/// impl TaskBody for Summarize {
///     async fn run(&mut self, ctx: TaskContext) -> AppResult<serde_json::Value> {
///         // Size internal parallelism from the granted CPU share.
///         let share = ctx.granted(&ResourceKind::Cpu);
///         let total = self.documents.len();
///         for (i, _doc) in self.documents.iter().enumerate() {
///             ctx.checkpoint().await;
///             ctx.report_progress((i + 1) as f64 / total as f64);
///         }
///         Ok(serde_json::json!({ "share": share, "count": total }))
///     }
///
///     fn pausable(&self) -> bool {
///         true
///     }
/// }
/// ```
#[async_trait]
pub trait TaskBody: Send + 'static {
    /// Run the body to completion.
    async fn run(&mut self, ctx: TaskContext) -> AppResult<serde_json::Value>;

    /// Whether this body polls [`TaskContext::checkpoint`] and may therefore
    /// be paused. Bodies that never check are effectively unpausable.
    fn pausable(&self) -> bool {
        false
    }
}

/// Abstraction for spawning task execution on a runtime.
pub trait Spawn {
    /// Spawn a future to run to completion in the background.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Adapter turning an async closure into a [`TaskBody`].
pub struct FnBody<F> {
    f: Option<F>,
    pausable: bool,
}

impl<F> FnBody<F> {
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self {
            f: Some(f),
            pausable: false,
        }
    }

    /// Declare that the closure honors cooperative pause.
    #[must_use]
    pub fn allow_pause(mut self) -> Self {
        self.pausable = true;
        self
    }
}

#[async_trait]
impl<F, Fut> TaskBody for FnBody<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = AppResult<serde_json::Value>> + Send + 'static,
{
    async fn run(&mut self, ctx: TaskContext) -> AppResult<serde_json::Value> {
        let f = self
            .f
            .take()
            .ok_or_else(|| anyhow::anyhow!("task body already ran"))?;
        f(ctx).await
    }

    fn pausable(&self) -> bool {
        self.pausable
    }
}

/// Handle given to a running body.
///
/// Exposes the amounts granted at admission, the progress callback, the
/// cooperative pause flag, the cancellation flag, and offload of blocking work
/// onto the scheduler's worker threads. Cloning is cheap.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    name: Arc<str>,
    granted: Arc<BTreeMap<ResourceKind, f64>>,
    control: Arc<TaskControl>,
    workers: Arc<WorkerPool>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        name: &str,
        granted: BTreeMap<ResourceKind, f64>,
        control: Arc<TaskControl>,
        workers: Arc<WorkerPool>,
    ) -> Self {
        Self {
            task_id,
            name: Arc::from(name),
            granted: Arc::new(granted),
            control,
            workers,
        }
    }

    /// Identifier of the running task.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Name of the running task.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Amount granted for `kind`, 0 if the task did not request it.
    #[must_use]
    pub fn granted(&self, kind: &ResourceKind) -> f64 {
        self.granted.get(kind).copied().unwrap_or(0.0)
    }

    /// All granted amounts.
    #[must_use]
    pub fn granted_amounts(&self) -> &BTreeMap<ResourceKind, f64> {
        &self.granted
    }

    /// Report fractional progress in `[0, 1]`. Out-of-range values are clamped.
    pub fn report_progress(&self, fraction: f64) {
        self.control.set_progress(fraction);
    }

    /// Append an intermediate result visible in task snapshots.
    pub fn push_result(&self, value: serde_json::Value) {
        self.control.push_result(value);
    }

    /// Whether the pause flag is raised.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancel_requested()
    }

    /// Safe point for cooperative pause: returns immediately when not paused,
    /// otherwise waits until the task is resumed.
    pub async fn checkpoint(&self) {
        let mut rx = self.control.pause_rx();
        loop {
            let paused = *rx.borrow_and_update();
            if !paused || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run a blocking or CPU-heavy closure on the scheduler's worker threads
    /// and await its result, keeping it off the async runtime.
    ///
    /// # Errors
    ///
    /// Fails with `SchedulerError::WorkerQueueFull` when the worker queue is
    /// saturated, `SchedulerError::WorkerPoolShutdown` after shutdown, or
    /// `SchedulerError::WorkerPanicked` if the closure panics.
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R, SchedulerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.workers.run(f).await
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("name", &self.name)
            .field("granted", &self.granted)
            .finish_non_exhaustive()
    }
}

//! Task records, lifecycle state, and inspection snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::executor::{FnBody, TaskBody, TaskContext};
use crate::core::resource_pool::EPSILON;
use crate::core::{AppResult, SchedulerError, TaskFailure};
use crate::util::clock::now_ms;
use crate::util::serde::{new_task_id, Priority, ResourceKind, TaskId};

/// Lifecycle state of a task.
///
/// `Pending -> Running -> {Completed | Failed | Canceled}`, with `Paused`
/// reachable only from `Running` and returning to it. A pending task may also
/// go straight to `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued, holding no resources.
    Pending,
    /// Admitted and executing.
    Running,
    /// Running with its cooperative pause flag raised.
    Paused,
    /// Body returned successfully.
    Completed,
    /// Body errored, panicked, or timed out.
    Failed,
    /// Canceled by a caller or by shutdown.
    Canceled,
}

impl TaskState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether a task in this state holds resource allocations.
    #[must_use]
    pub const fn holds_resources(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// One resource a task needs to be admitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRequirement {
    /// Pool the amount is drawn from.
    pub kind: ResourceKind,
    /// Desired share, in `(0, 1]`.
    pub requested: f64,
    /// Floor below which the task cannot proceed.
    pub minimum: f64,
    /// Whether a grant between `minimum` and `requested` is acceptable.
    pub scalable: bool,
}

impl ResourceRequirement {
    /// A requirement that must be met in full.
    #[must_use]
    pub fn fixed(kind: ResourceKind, amount: f64) -> Self {
        Self {
            kind,
            requested: amount,
            minimum: amount,
            scalable: false,
        }
    }

    /// A requirement that accepts anything between `minimum` and `requested`.
    #[must_use]
    pub fn scalable(kind: ResourceKind, requested: f64, minimum: f64) -> Self {
        Self {
            kind,
            requested,
            minimum,
            scalable: true,
        }
    }

    /// The smallest grant that satisfies this requirement.
    #[must_use]
    pub fn floor(&self) -> f64 {
        if self.scalable {
            self.minimum
        } else {
            self.requested
        }
    }

    /// Check the amounts are in range.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidRequirement` when `requested` is not in
    /// `(0, 1]` or `minimum` is not in `[0, requested]`.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let invalid = |reason: String| SchedulerError::InvalidRequirement {
            kind: self.kind.clone(),
            reason,
        };
        if !self.requested.is_finite() || self.requested <= 0.0 || self.requested > 1.0 + EPSILON {
            return Err(invalid(format!(
                "requested amount must be in (0, 1], got {}",
                self.requested
            )));
        }
        if !self.minimum.is_finite() || self.minimum < 0.0 || self.minimum > self.requested + EPSILON {
            return Err(invalid(format!(
                "minimum amount must be in [0, {}], got {}",
                self.requested, self.minimum
            )));
        }
        Ok(())
    }
}

/// A unit of work ready to be submitted.
///
/// Built with [`Task::new`] or [`Task::from_fn`] and refined with the `with_*`
/// methods. The scheduler takes ownership on submit.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) requirements: Vec<ResourceRequirement>,
    pub(crate) dependencies: BTreeSet<TaskId>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) parent_id: Option<TaskId>,
    pub(crate) created_at_ms: u128,
    pub(crate) body: Box<dyn TaskBody>,
}

impl Task {
    /// Create a task around an executable body.
    pub fn new(name: impl Into<String>, body: impl TaskBody) -> Self {
        Self {
            id: new_task_id(),
            name: name.into(),
            priority: Priority::default(),
            requirements: Vec::new(),
            dependencies: BTreeSet::new(),
            timeout: None,
            parent_id: None,
            created_at_ms: now_ms(),
            body: Box::new(body),
        }
    }

    /// Create a task from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = AppResult<serde_json::Value>> + Send + 'static,
    {
        Self::new(name, FnBody::new(f))
    }

    /// Create a pausable task from an async closure. The closure is expected
    /// to call [`TaskContext::checkpoint`] at safe points.
    pub fn pausable_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = AppResult<serde_json::Value>> + Send + 'static,
    {
        Self::new(name, FnBody::new(f).allow_pause())
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Append a resource requirement. Requirements are allocated in order.
    #[must_use]
    pub fn with_requirement(mut self, requirement: ResourceRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Require a task to have completed before this one is admitted.
    #[must_use]
    pub fn with_dependency(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }

    /// Bound the body's execution time.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Task identifier, assigned at construction.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("requirements", &self.requirements)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("parent_id", &self.parent_id)
            .finish_non_exhaustive()
    }
}

/// Advisory progress reported by a running body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    /// Fraction complete, clamped to `[0, 1]`.
    pub fraction: f64,
    /// Intermediate results in report order.
    pub intermediate_results: Vec<serde_json::Value>,
    /// Time of the last update (ms since epoch).
    pub updated_at_ms: Option<u128>,
}

/// Shared control block between the scheduler and a running body.
#[derive(Debug)]
pub(crate) struct TaskControl {
    progress: Mutex<Progress>,
    pause_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
}

impl TaskControl {
    pub(crate) fn new() -> Self {
        Self {
            progress: Mutex::new(Progress::default()),
            pause_tx: watch::Sender::new(false),
            cancel_tx: watch::Sender::new(false),
        }
    }

    pub(crate) fn progress(&self) -> Progress {
        self.progress.lock().clone()
    }

    pub(crate) fn set_progress(&self, fraction: f64) {
        let mut progress = self.progress.lock();
        progress.fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        progress.updated_at_ms = Some(now_ms());
    }

    pub(crate) fn push_result(&self, value: serde_json::Value) {
        let mut progress = self.progress.lock();
        progress.intermediate_results.push(value);
        progress.updated_at_ms = Some(now_ms());
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.pause_tx.send_replace(paused);
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub(crate) fn pause_rx(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    /// Raise the cancel flag. Returns false if it was already raised.
    pub(crate) fn request_cancel(&self) -> bool {
        !self.cancel_tx.send_replace(true)
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        loop {
            let cancelled = *rx.borrow_and_update();
            // The sender lives in `self`, so `changed` cannot fail while borrowed.
            if cancelled || rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Scheduler-owned bookkeeping for a task that has not yet terminated.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) priority: Priority,
    pub(crate) requirements: Vec<ResourceRequirement>,
    pub(crate) dependencies: BTreeSet<TaskId>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) pausable: bool,
    pub(crate) parent_id: Option<TaskId>,
    pub(crate) created_at_ms: u128,
    pub(crate) seq: u64,
    pub(crate) state: TaskState,
    pub(crate) started_at_ms: Option<u128>,
    pub(crate) granted: BTreeMap<ResourceKind, f64>,
    pub(crate) control: Arc<TaskControl>,
}

impl TaskRecord {
    /// Split a submitted task into its record and its body.
    pub(crate) fn from_task(task: Task, seq: u64, default_timeout: Option<Duration>) -> (Self, Box<dyn TaskBody>) {
        let pausable = task.body.pausable();
        let record = Self {
            id: task.id,
            name: task.name,
            priority: task.priority,
            requirements: task.requirements,
            dependencies: task.dependencies,
            timeout: task.timeout.or(default_timeout),
            pausable,
            parent_id: task.parent_id,
            created_at_ms: task.created_at_ms,
            seq,
            state: TaskState::Pending,
            started_at_ms: None,
            granted: BTreeMap::new(),
            control: Arc::new(TaskControl::new()),
        };
        (record, task.body)
    }

    /// Snapshot of a live (pending, running, or paused) task.
    pub(crate) fn snapshot(&self, subtask_ids: Vec<TaskId>) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            priority: self.priority,
            state: self.state,
            requirements: self.requirements.clone(),
            granted: self.granted.clone(),
            dependencies: self.dependencies.iter().copied().collect(),
            pausable: self.pausable,
            timeout_ms: self.timeout.map(|t| t.as_millis()),
            parent_id: self.parent_id,
            subtask_ids,
            progress: self.control.progress(),
            created_at_ms: self.created_at_ms,
            started_at_ms: self.started_at_ms,
            completed_at_ms: None,
            result: None,
            error: None,
        }
    }

    /// Freeze into a terminal snapshot for history.
    pub(crate) fn into_terminal(
        self,
        state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<TaskFailure>,
        subtask_ids: Vec<TaskId>,
    ) -> TaskSnapshot {
        let mut snapshot = self.snapshot(subtask_ids);
        snapshot.state = state;
        snapshot.granted = BTreeMap::new();
        snapshot.completed_at_ms = Some(now_ms());
        snapshot.result = result;
        snapshot.error = error;
        snapshot
    }
}

/// Read-only view of a task at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub id: TaskId,
    /// Human-readable name.
    pub name: String,
    /// Priority.
    pub priority: Priority,
    /// Lifecycle state.
    pub state: TaskState,
    /// Requirements as submitted.
    pub requirements: Vec<ResourceRequirement>,
    /// Amounts granted per resource while running; empty otherwise.
    pub granted: BTreeMap<ResourceKind, f64>,
    /// Tasks that must complete before this one is admitted.
    pub dependencies: Vec<TaskId>,
    /// Whether the body honors cooperative pause.
    pub pausable: bool,
    /// Effective timeout in milliseconds.
    pub timeout_ms: Option<u128>,
    /// Parent task, for subtasks.
    pub parent_id: Option<TaskId>,
    /// Direct subtasks.
    pub subtask_ids: Vec<TaskId>,
    /// Latest progress report.
    pub progress: Progress,
    /// Creation time (ms since epoch).
    pub created_at_ms: u128,
    /// Admission time (ms since epoch).
    pub started_at_ms: Option<u128>,
    /// Termination time (ms since epoch).
    pub completed_at_ms: Option<u128>,
    /// Value returned by a completed body.
    pub result: Option<serde_json::Value>,
    /// Failure cause for failed tasks.
    pub error: Option<TaskFailure>,
}

/// A task and its subtasks, recursively.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskTree {
    /// The task at this node.
    pub task: TaskSnapshot,
    /// Subtask trees in creation order.
    pub children: Vec<TaskTree>,
}

impl TaskTree {
    /// Number of nodes in the tree, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(Self::len).sum::<usize>()
    }

    /// Always false; a tree has at least its root.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Find a node by task id.
    #[must_use]
    pub fn find(&self, id: &TaskId) -> Option<&Self> {
        if &self.task.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirement_validation() {
        assert!(ResourceRequirement::fixed(ResourceKind::Cpu, 0.5).validate().is_ok());
        assert!(ResourceRequirement::fixed(ResourceKind::Cpu, 1.0).validate().is_ok());
        assert!(ResourceRequirement::fixed(ResourceKind::Cpu, 0.0).validate().is_err());
        assert!(ResourceRequirement::fixed(ResourceKind::Cpu, 1.5).validate().is_err());
        assert!(ResourceRequirement::scalable(ResourceKind::Cpu, 0.5, 0.6).validate().is_err());
        assert!(ResourceRequirement::scalable(ResourceKind::Cpu, 0.5, -0.1).validate().is_err());
        assert!(ResourceRequirement::scalable(ResourceKind::Cpu, 0.5, 0.0).validate().is_ok());
    }

    #[test]
    fn test_floor_depends_on_scalability() {
        let mut req = ResourceRequirement::scalable(ResourceKind::Memory, 0.8, 0.2);
        assert!((req.floor() - 0.2).abs() < f64::EPSILON);
        req.scalable = false;
        assert!((req.floor() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_state_predicates() {
        assert!(TaskState::Running.holds_resources());
        assert!(TaskState::Paused.holds_resources());
        assert!(!TaskState::Pending.holds_resources());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
    }

    #[test]
    fn test_progress_is_clamped() {
        let control = TaskControl::new();
        control.set_progress(1.7);
        assert!((control.progress().fraction - 1.0).abs() < f64::EPSILON);
        control.set_progress(-0.3);
        assert!(control.progress().fraction.abs() < f64::EPSILON);
        control.push_result(serde_json::json!({"step": 1}));
        assert_eq!(control.progress().intermediate_results.len(), 1);
    }

    #[test]
    fn test_cancel_request_reports_first_call() {
        let control = TaskControl::new();
        assert!(control.request_cancel());
        assert!(!control.request_cancel());
        assert!(control.is_cancel_requested());
    }

    #[test]
    fn test_task_builder() {
        let dep = new_task_id();
        let task = Task::from_fn("build", |_ctx| async { Ok(serde_json::Value::Null) })
            .with_priority(Priority::High)
            .with_requirement(ResourceRequirement::fixed(ResourceKind::Cpu, 0.25))
            .with_dependency(dep)
            .with_timeout(Duration::from_secs(3));
        assert_eq!(task.priority(), Priority::High);
        assert_eq!(task.name(), "build");
        assert!(task.dependencies.contains(&dep));

        let (record, body) = TaskRecord::from_task(task, 0, None);
        assert!(!body.pausable());
        assert_eq!(record.timeout, Some(Duration::from_secs(3)));
        assert_eq!(record.state, TaskState::Pending);
    }
}

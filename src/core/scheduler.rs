//! Resource-aware priority scheduler.
//!
//! Tasks wait in a priority queue until an admission pass finds that their
//! dependencies have completed, the optional admission predicate accepts them,
//! and every resource requirement can be met. Admitted tasks run on the
//! configured [`Spawn`] implementation; on termination their allocations are
//! released and the next admission pass runs.
//!
//! # Admission coordinator
//!
//! Admission passes run on one coordinator task spawned with the scheduler.
//! Submission, completion, cancellation, and the policy knobs only record the
//! change and wake the coordinator, so tasks submitted back to back are ranked
//! against each other in a single pass. [`Scheduler::settle`] waits for the
//! coordinator to catch up with every request made so far.
//!
//! # Locking
//!
//! All lifecycle bookkeeping lives behind one `parking_lot::Mutex`. The
//! admission pass, completion, and cancellation run entirely under it, so
//! capacity accounting and the concurrency ceiling are never observed half
//! applied. Lock order is scheduler state, then the pool map, then an
//! individual pool.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::config::SchedulerConfig;
use crate::core::audit::{build_audit_event, AuditAction, AuditSink};
use crate::core::error::panic_message;
use crate::core::executor::{Spawn, TaskBody, TaskContext};
use crate::core::queue::{AdmissionQueue, PendingTask};
use crate::core::resource_pool::{PoolSnapshot, ResourcePool, EPSILON};
use crate::core::task::{Task, TaskControl, TaskRecord, TaskSnapshot, TaskState, TaskTree};
use crate::core::worker_pool::{WorkerPool, WorkerPoolStats};
use crate::core::{SchedulerError, TaskFailure};
use crate::runtime::TokioSpawner;
use crate::util::serde::{ResourceKind, TaskId};

/// Caller-supplied admission veto.
///
/// Called under the scheduler lock with a snapshot of the candidate task; it
/// must be fast and must not call back into the scheduler. A predicate that
/// panics vetoes the candidate for that pass.
pub type AdmissionPredicate = Arc<dyn Fn(&TaskSnapshot) -> bool + Send + Sync>;

/// Aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Tasks accepted by `submit`.
    pub submitted: u64,
    /// Tasks admitted and dispatched.
    pub admitted: u64,
    /// Tasks whose body returned successfully.
    pub completed: u64,
    /// Tasks that errored or panicked.
    pub failed: u64,
    /// Tasks that exceeded their timeout.
    pub timed_out: u64,
    /// Tasks canceled while queued or running.
    pub canceled: u64,
    /// Tasks waiting for admission.
    pub queued: usize,
    /// Tasks running or paused.
    pub active: usize,
    /// Terminal tasks retained in history.
    pub history_len: usize,
    /// Current concurrency ceiling.
    pub max_concurrent_tasks: usize,
}

/// How a running body ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed(serde_json::Value),
    Failed(TaskFailure),
    Canceled,
}

#[derive(Default)]
struct SchedulerState {
    queue: AdmissionQueue,
    active: HashMap<TaskId, TaskRecord>,
    history: VecDeque<TaskSnapshot>,
    /// Ids that are queued, active, or still retained in history.
    known: HashSet<TaskId>,
    /// Ids that reached `Completed` and are either retained in history or
    /// still awaited by a queued dependent.
    completed: HashSet<TaskId>,
    /// Dependency id to the number of queued tasks waiting on it.
    awaited: HashMap<TaskId, usize>,
    children: HashMap<TaskId, Vec<TaskId>>,
    watchers: HashMap<TaskId, watch::Sender<Option<TaskSnapshot>>>,
    next_seq: u64,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn subtasks_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.children.get(id).cloned().unwrap_or_default()
    }

    fn find_snapshot(&self, id: &TaskId) -> Option<TaskSnapshot> {
        if let Some(record) = self.active.get(id) {
            return Some(record.snapshot(self.subtasks_of(id)));
        }
        if let Some(pending) = self.queue.get(id) {
            return Some(pending.record.snapshot(self.subtasks_of(id)));
        }
        self.retained(id)
    }

    /// A history snapshot with its subtask list brought up to date; subtasks
    /// may be attached to a parent after it terminated.
    fn retained(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.history
            .iter()
            .rev()
            .find(|s| &s.id == id)
            .map(|s| self.refreshed(s))
    }

    fn refreshed(&self, snapshot: &TaskSnapshot) -> TaskSnapshot {
        let mut snapshot = snapshot.clone();
        if let Some(children) = self.children.get(&snapshot.id) {
            snapshot.subtask_ids.clone_from(children);
        }
        snapshot
    }

    fn await_dependencies(&mut self, dependencies: &BTreeSet<TaskId>) {
        for dependency in dependencies {
            *self.awaited.entry(*dependency).or_insert(0) += 1;
        }
    }

    /// Called when a dependent leaves the queue.
    fn release_dependencies(&mut self, dependencies: &BTreeSet<TaskId>) {
        for dependency in dependencies {
            let Some(count) = self.awaited.get_mut(dependency) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.awaited.remove(dependency);
                if !self.known.contains(dependency) {
                    self.completed.remove(dependency);
                }
            }
        }
    }

    /// Drop bookkeeping for a task whose snapshot was evicted from history.
    fn forget(&mut self, id: &TaskId) {
        self.known.remove(id);
        self.children.remove(id);
        if !self.awaited.contains_key(id) {
            self.completed.remove(id);
        }
    }

    fn build_tree(&self, id: &TaskId) -> Option<TaskTree> {
        let task = self.find_snapshot(id)?;
        let children = self
            .subtasks_of(id)
            .iter()
            .filter_map(|child| self.build_tree(child))
            .collect();
        Some(TaskTree { task, children })
    }
}

/// Wakes the admission coordinator and tracks how far it has caught up.
struct AdmissionSignal {
    notify: Notify,
    requested: AtomicU64,
    processed: watch::Sender<u64>,
}

impl AdmissionSignal {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            requested: AtomicU64::new(0),
            processed: watch::Sender::new(0),
        }
    }

    /// Record that state changed in a way that may admit a task.
    fn request(&self) {
        self.requested.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    fn mark_processed(&self, upto: u64) {
        self.processed.send_if_modified(|processed| {
            if upto > *processed {
                *processed = upto;
                true
            } else {
                false
            }
        });
    }
}

struct SchedulerInner<S> {
    state: Mutex<SchedulerState>,
    admission: Arc<AdmissionSignal>,
    pools: RwLock<BTreeMap<ResourceKind, Arc<ResourcePool>>>,
    max_concurrent: AtomicUsize,
    max_queue_depth: usize,
    history_capacity: usize,
    default_timeout: Option<Duration>,
    predicate: RwLock<Option<AdmissionPredicate>>,
    audit: Option<Mutex<Box<dyn AuditSink>>>,
    workers: Arc<WorkerPool>,
    spawner: S,
    shutting_down: AtomicBool,
    active_count: watch::Sender<usize>,
}

impl<S> Drop for SchedulerInner<S> {
    fn drop(&mut self) {
        // Lets the coordinator observe that the scheduler is gone.
        self.admission.notify.notify_one();
    }
}

/// Priority scheduler with per-resource capacity accounting.
///
/// Cloning yields another handle to the same scheduler.
///
/// The [`Spawn`] implementation must not poll the spawned future inline; the
/// future reports completion by taking the scheduler lock.
pub struct Scheduler<S = TokioSpawner> {
    inner: Arc<SchedulerInner<S>>,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Scheduler<TokioSpawner> {
    /// Create a scheduler spawning onto the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for an invalid configuration and
    /// `SchedulerError::Runtime` outside a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::with_spawner(config, TokioSpawner::current()?)
    }
}

impl<S> Scheduler<S>
where
    S: Spawn + Send + Sync + 'static,
{
    /// Create a scheduler with a custom spawner.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for an invalid configuration and
    /// `SchedulerError::Runtime` if worker threads cannot be started.
    pub fn with_spawner(config: SchedulerConfig, spawner: S) -> Result<Self, SchedulerError> {
        Self::from_parts(config, spawner, None, None)
    }

    pub(crate) fn from_parts(
        config: SchedulerConfig,
        spawner: S,
        audit: Option<Box<dyn AuditSink>>,
        predicate: Option<AdmissionPredicate>,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let mut pools = BTreeMap::new();
        for (kind, capacity) in &config.resources {
            pools.insert(kind.clone(), Arc::new(ResourcePool::new(kind.clone(), *capacity)?));
        }
        let workers = Arc::new(WorkerPool::new(config.workers.clone())?);

        tracing::info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            pools = pools.len(),
            history_capacity = config.history_capacity,
            "scheduler initialized"
        );

        let scheduler = Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::default()),
                admission: Arc::new(AdmissionSignal::new()),
                pools: RwLock::new(pools),
                max_concurrent: AtomicUsize::new(config.max_concurrent_tasks),
                max_queue_depth: config.max_queue_depth,
                history_capacity: config.history_capacity,
                default_timeout: config.default_timeout(),
                predicate: RwLock::new(predicate),
                audit: audit.map(Mutex::new),
                workers,
                spawner,
                shutting_down: AtomicBool::new(false),
                active_count: watch::Sender::new(0),
            }),
        };
        scheduler.spawn_coordinator();
        Ok(scheduler)
    }

    /// Run admission passes whenever a request arrives, until the scheduler
    /// shuts down or its last handle is dropped.
    fn spawn_coordinator(&self) {
        let handle = Arc::downgrade(&self.inner);
        let signal = Arc::clone(&self.inner.admission);
        self.inner.spawner.spawn(async move {
            loop {
                signal.notify.notified().await;
                let Some(scheduler) = upgrade(&handle) else {
                    break;
                };
                let target = signal.requested.load(Ordering::Acquire);
                if scheduler.is_shut_down() {
                    signal.mark_processed(target);
                    break;
                }
                {
                    let mut state = scheduler.inner.state.lock();
                    scheduler.run_admission(&mut state);
                }
                signal.mark_processed(target);
            }
            tracing::debug!("admission coordinator stopped");
        });
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Set the capacity of a pool, creating it if absent, then request admission.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for a non-positive capacity and
    /// `SchedulerError::CapacityBelowCommitted` when shrinking below what is
    /// allocated plus reserved.
    pub fn configure_resource(&self, kind: ResourceKind, capacity: f64) -> Result<(), SchedulerError> {
        {
            let _state = self.inner.state.lock();
            let mut pools = self.inner.pools.write();
            if let Some(pool) = pools.get(&kind) {
                pool.set_capacity(capacity)?;
            } else {
                pools.insert(kind.clone(), Arc::new(ResourcePool::new(kind.clone(), capacity)?));
            }
        }
        tracing::info!(%kind, capacity, "resource pool configured");
        self.inner.admission.request();
        Ok(())
    }

    /// Change the concurrency ceiling. Running tasks above a lowered ceiling
    /// are not preempted; admission simply waits until the count drops.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` for zero.
    pub fn set_max_concurrent_tasks(&self, n: usize) -> Result<(), SchedulerError> {
        if n == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_concurrent_tasks must be greater than 0".into(),
            ));
        }
        let previous = self.inner.max_concurrent.swap(n, Ordering::AcqRel);
        if previous != n {
            tracing::info!(previous, current = n, "concurrency ceiling changed");
        }
        self.inner.admission.request();
        Ok(())
    }

    /// Current concurrency ceiling.
    #[must_use]
    pub fn max_concurrent_tasks(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::Acquire)
    }

    /// Install an admission predicate, replacing any previous one.
    pub fn set_admission_predicate<F>(&self, predicate: F)
    where
        F: Fn(&TaskSnapshot) -> bool + Send + Sync + 'static,
    {
        *self.inner.predicate.write() = Some(Arc::new(predicate));
        self.inner.admission.request();
    }

    /// Remove the admission predicate.
    pub fn clear_admission_predicate(&self) {
        *self.inner.predicate.write() = None;
        self.inner.admission.request();
    }

    // ------------------------------------------------------------------
    // Submission and control
    // ------------------------------------------------------------------

    /// Queue a task and wake the admission coordinator. The task is ranked
    /// against everything else queued when the next pass runs.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::ShutDown` once shutdown has begun
    /// - `SchedulerError::InvalidRequirement` for out-of-range amounts
    /// - `SchedulerError::UnknownResource` for a kind with no pool
    /// - `SchedulerError::UnknownDependency` for a dependency never submitted
    /// - `SchedulerError::QueueFull` when the queue is at its depth limit
    pub fn submit(&self, task: Task) -> Result<TaskId, SchedulerError> {
        self.validate(&task)?;
        let mut state = self.inner.state.lock();
        self.enqueue(&mut state, task)
    }

    /// Submit `task` as a subtask of `parent_id`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::TaskNotFound` if the parent was never
    /// submitted or has been evicted from history, otherwise the same errors
    /// as [`Scheduler::submit`].
    pub fn create_subtask(&self, parent_id: TaskId, mut task: Task) -> Result<TaskId, SchedulerError> {
        self.validate(&task)?;
        let mut state = self.inner.state.lock();
        if !state.known.contains(&parent_id) {
            return Err(SchedulerError::TaskNotFound(parent_id));
        }
        task.parent_id = Some(parent_id);
        self.enqueue(&mut state, task)
    }

    /// Cancel a task. A queued task is removed without ever touching a pool;
    /// a running or paused task has its cancel flag raised and terminates as
    /// `Canceled` once its runner observes it. Returns false for unknown or
    /// already terminated tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.inner.state.lock();
        if let Some(pending) = state.queue.remove(&id) {
            self.cancel_pending(&mut state, pending, "canceled while queued");
            return true;
        }
        if let Some(record) = state.active.get(&id) {
            if record.control.request_cancel() {
                tracing::info!(task_id = %id, name = %record.name, "cancellation requested");
            }
            return true;
        }
        false
    }

    /// Raise the pause flag of a running, pausable task. The task keeps its
    /// allocations. Returns false when the task is not running or not
    /// pausable.
    pub fn pause(&self, id: TaskId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(record) = state.active.get_mut(&id) else {
            return false;
        };
        if !record.pausable || record.state != TaskState::Running {
            return false;
        }
        record.state = TaskState::Paused;
        record.control.set_paused(true);
        tracing::info!(task_id = %id, name = %record.name, "task paused");
        let name = record.name.clone();
        self.audit(id, &name, AuditAction::Pause, None);
        true
    }

    /// Clear the pause flag of a paused task. Returns false when the task is
    /// not paused.
    pub fn resume(&self, id: TaskId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(record) = state.active.get_mut(&id) else {
            return false;
        };
        if record.state != TaskState::Paused {
            return false;
        }
        record.state = TaskState::Running;
        record.control.set_paused(false);
        tracing::info!(task_id = %id, name = %record.name, "task resumed");
        let name = record.name.clone();
        self.audit(id, &name, AuditAction::Resume, None);
        true
    }

    /// Wait until a task terminates and return its terminal snapshot.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::TaskNotFound` if the task is not live and not
    /// in history.
    pub async fn wait(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        let mut rx = {
            let mut state = self.inner.state.lock();
            if let Some(snapshot) = state.retained(&id) {
                return Ok(snapshot);
            }
            if !state.active.contains_key(&id) && !state.queue.contains(&id) {
                return Err(SchedulerError::TaskNotFound(id));
            }
            state
                .watchers
                .entry(id)
                .or_insert_with(|| watch::Sender::new(None))
                .subscribe()
        };
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(snapshot) = current {
                return Ok(snapshot);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone().ok_or(SchedulerError::TaskNotFound(id));
            }
        }
    }

    // ------------------------------------------------------------------
    // Reservations
    // ------------------------------------------------------------------

    /// Hold up to `amount` of a pool's capacity outside task admission and
    /// return the amount actually reserved.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::UnknownResource` for a kind with no pool and
    /// `SchedulerError::InvalidConfig` for a negative or non-finite amount.
    pub fn reserve_capacity(&self, kind: &ResourceKind, amount: f64) -> Result<f64, SchedulerError> {
        check_amount(amount)?;
        let pool = self.pool(kind)?;
        let reserved = pool.reserve(amount);
        tracing::debug!(%kind, requested = amount, reserved, "capacity reserved");
        Ok(reserved)
    }

    /// Give back reserved capacity, then request admission.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::UnknownResource` for a kind with no pool and
    /// `SchedulerError::InvalidConfig` for a negative or non-finite amount.
    pub fn release_reservation(&self, kind: &ResourceKind, amount: f64) -> Result<f64, SchedulerError> {
        check_amount(amount)?;
        let pool = self.pool(kind)?;
        let released = pool.release_reservation(amount);
        tracing::debug!(%kind, released, "reservation released");
        self.inner.admission.request();
        Ok(released)
    }

    /// Wait until every admission pass requested before this call has run.
    ///
    /// Submissions, completions, and policy changes take effect on the queue
    /// and active set once the coordinator processes them; await this to
    /// observe that effect. Returns at once after shutdown.
    pub async fn settle(&self) {
        let target = self.inner.admission.requested.load(Ordering::Acquire);
        let mut processed = self.inner.admission.processed.subscribe();
        loop {
            let done = *processed.borrow_and_update();
            if done >= target || self.is_shut_down() || processed.changed().await.is_err() {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Snapshot of any live or retained task.
    #[must_use]
    pub fn get_task(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.state.lock().find_snapshot(&id)
    }

    /// Queued tasks in admission order.
    #[must_use]
    pub fn queue_snapshot(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock();
        state.queue.snapshots(|id| state.subtasks_of(id))
    }

    /// Running and paused tasks, oldest admission first.
    #[must_use]
    pub fn active_snapshot(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock();
        let mut records: Vec<&TaskRecord> = state.active.values().collect();
        records.sort_by_key(|r| (r.started_at_ms, r.seq));
        records
            .into_iter()
            .map(|r| r.snapshot(state.subtasks_of(&r.id)))
            .collect()
    }

    /// Retained terminal tasks, oldest first.
    #[must_use]
    pub fn history_snapshot(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock();
        state.history.iter().map(|s| state.refreshed(s)).collect()
    }

    /// Every pool.
    #[must_use]
    pub fn resource_snapshot(&self) -> Vec<PoolSnapshot> {
        self.inner.pools.read().values().map(|p| p.snapshot()).collect()
    }

    /// One pool.
    #[must_use]
    pub fn resource(&self, kind: &ResourceKind) -> Option<PoolSnapshot> {
        self.inner.pools.read().get(kind).map(|p| p.snapshot())
    }

    /// A task with its subtasks, recursively. Subtasks evicted from history
    /// are omitted.
    #[must_use]
    pub fn task_tree(&self, root: TaskId) -> Option<TaskTree> {
        self.inner.state.lock().build_tree(&root)
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            queued: state.queue.len(),
            active: state.active.len(),
            history_len: state.history.len(),
            max_concurrent_tasks: self.max_concurrent_tasks(),
            ..state.stats
        }
    }

    /// Blocking worker pool statistics.
    #[must_use]
    pub fn worker_stats(&self) -> WorkerPoolStats {
        self.inner.workers.stats()
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop admitting, cancel every queued and running task, wait for running
    /// tasks to terminate, drop reservations, and stop the worker threads.
    /// Calling it again waits for the same drain.
    pub async fn shutdown(&self) {
        let first = !self.inner.shutting_down.swap(true, Ordering::AcqRel);
        if first {
            tracing::info!("scheduler shutting down");
            let mut state = self.inner.state.lock();
            let drained = state.queue.drain_sorted();
            for pending in drained {
                self.cancel_pending(&mut state, pending, "canceled by shutdown");
            }
            for record in state.active.values() {
                record.control.request_cancel();
            }
            drop(state);
            let signal = &self.inner.admission;
            signal.request();
            signal.mark_processed(signal.requested.load(Ordering::Acquire));
        }

        let mut active = self.inner.active_count.subscribe();
        loop {
            let remaining = *active.borrow_and_update();
            if remaining == 0 || active.changed().await.is_err() {
                break;
            }
            tracing::debug!(remaining, "waiting for running tasks");
        }

        for pool in self.inner.pools.read().values() {
            pool.release_reservation(f64::INFINITY);
        }

        let workers = Arc::clone(&self.inner.workers);
        if let Err(e) = tokio::task::spawn_blocking(move || workers.shutdown()).await {
            tracing::error!(error = %e, "worker pool shutdown failed");
        }
        if first {
            tracing::info!("scheduler shut down");
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn pool(&self, kind: &ResourceKind) -> Result<Arc<ResourcePool>, SchedulerError> {
        self.inner
            .pools
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownResource(kind.clone()))
    }

    fn validate(&self, task: &Task) -> Result<(), SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        let pools = self.inner.pools.read();
        for requirement in &task.requirements {
            requirement.validate()?;
            if !pools.contains_key(&requirement.kind) {
                return Err(SchedulerError::UnknownResource(requirement.kind.clone()));
            }
        }
        Ok(())
    }

    fn enqueue(&self, state: &mut SchedulerState, task: Task) -> Result<TaskId, SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        if let Some(missing) = task
            .dependencies
            .iter()
            .find(|d| !state.known.contains(*d) && !state.completed.contains(*d))
        {
            return Err(SchedulerError::UnknownDependency(*missing));
        }
        if state.queue.len() >= self.inner.max_queue_depth {
            return Err(SchedulerError::QueueFull(format!(
                "{} tasks already queued",
                state.queue.len()
            )));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let (record, body) = TaskRecord::from_task(task, seq, self.inner.default_timeout);
        let id = record.id;

        tracing::debug!(
            task_id = %id,
            name = %record.name,
            priority = %record.priority,
            dependencies = record.dependencies.len(),
            "task submitted"
        );
        self.audit(id, &record.name, AuditAction::Submit, None);

        if let Some(parent) = record.parent_id {
            state.children.entry(parent).or_default().push(id);
        }
        state.known.insert(id);
        state.await_dependencies(&record.dependencies);
        state.queue.push(PendingTask { record, body });
        state.stats.submitted += 1;

        self.inner.admission.request();
        Ok(id)
    }

    /// Admit as many tasks as the ceiling, dependencies, predicate, and pools
    /// allow. Tasks that cannot be admitted keep their place in the queue.
    fn run_admission(&self, state: &mut SchedulerState) {
        if self.is_shut_down() {
            return;
        }
        let max = self.max_concurrent_tasks();
        if state.active.len() >= max || state.queue.is_empty() {
            return;
        }

        let predicate = self.inner.predicate.read().clone();
        let pools = self.inner.pools.read();
        let mut deferred = Vec::new();

        while state.active.len() < max {
            let Some(pending) = state.queue.pop() else {
                break;
            };
            let id = pending.record.id;

            if let Some(dep) = pending
                .record
                .dependencies
                .iter()
                .find(|d| !state.completed.contains(*d))
            {
                tracing::trace!(task_id = %id, dependency = %dep, "waiting on dependency");
                deferred.push(pending);
                continue;
            }

            if let Some(predicate) = &predicate {
                let snapshot = pending.record.snapshot(state.subtasks_of(&id));
                match std::panic::catch_unwind(AssertUnwindSafe(|| predicate(&snapshot))) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::trace!(task_id = %id, "admission predicate declined");
                        deferred.push(pending);
                        continue;
                    }
                    Err(payload) => {
                        tracing::warn!(
                            task_id = %id,
                            panic = %panic_message(payload.as_ref()),
                            "admission predicate panicked, treating as a veto"
                        );
                        deferred.push(pending);
                        continue;
                    }
                }
            }

            match allocate_all(&pools, &pending.record) {
                Ok(granted) => self.dispatch(state, pending, granted),
                Err(reason) => {
                    tracing::trace!(task_id = %id, %reason, "insufficient resources");
                    deferred.push(pending);
                }
            }
        }
        drop(pools);

        for pending in deferred {
            state.queue.push(pending);
        }
    }

    fn dispatch(&self, state: &mut SchedulerState, pending: PendingTask, granted: BTreeMap<ResourceKind, f64>) {
        let PendingTask { mut record, body } = pending;
        let id = record.id;
        state.release_dependencies(&record.dependencies);
        record.state = TaskState::Running;
        record.started_at_ms = Some(crate::util::clock::now_ms());
        record.granted = granted.clone();

        let control = Arc::clone(&record.control);
        let timeout = record.timeout;
        let ctx = TaskContext::new(
            id,
            &record.name,
            granted,
            Arc::clone(&control),
            Arc::clone(&self.inner.workers),
        );

        tracing::info!(
            task_id = %id,
            name = %record.name,
            priority = %record.priority,
            granted = ?record.granted,
            "task admitted"
        );
        self.audit(id, &record.name, AuditAction::Admit, None);

        state.active.insert(id, record);
        state.stats.admitted += 1;
        self.inner.active_count.send_replace(state.active.len());

        let scheduler = self.clone();
        self.inner.spawner.spawn(async move {
            let outcome = execute(body, ctx, control, timeout).await;
            scheduler.finish(id, outcome);
        });
    }

    /// Terminate an active task: release its allocations, move it to history,
    /// and request admission. Returns false if the task was not active, which
    /// makes a repeated completion a no-op.
    pub(crate) fn finish(&self, id: TaskId, outcome: Outcome) -> bool {
        let mut state = self.inner.state.lock();
        let Some(record) = state.active.remove(&id) else {
            tracing::debug!(task_id = %id, "ignoring completion for inactive task");
            return false;
        };

        let released: f64 = self
            .inner
            .pools
            .read()
            .values()
            .map(|pool| pool.release(&id))
            .sum();

        let (terminal, result, error, action) = match outcome {
            Outcome::Completed(value) => (TaskState::Completed, Some(value), None, AuditAction::Complete),
            Outcome::Failed(failure) => {
                let action = if failure.is_timeout() {
                    AuditAction::Timeout
                } else {
                    AuditAction::Fail
                };
                (TaskState::Failed, None, Some(failure), action)
            }
            Outcome::Canceled => (TaskState::Canceled, None, None, AuditAction::Cancel),
        };

        match (&terminal, &error) {
            (TaskState::Completed, _) => {
                state.stats.completed += 1;
                state.completed.insert(id);
                tracing::info!(task_id = %id, name = %record.name, released, "task completed");
            }
            (TaskState::Failed, Some(failure)) if failure.is_timeout() => {
                state.stats.timed_out += 1;
                tracing::warn!(task_id = %id, name = %record.name, %failure, "task timed out");
            }
            (TaskState::Failed, failure) => {
                state.stats.failed += 1;
                tracing::error!(task_id = %id, name = %record.name, failure = ?failure, "task failed");
            }
            _ => {
                state.stats.canceled += 1;
                tracing::warn!(task_id = %id, name = %record.name, released, "task canceled");
            }
        }

        let detail = error.as_ref().map(ToString::to_string);
        let name = record.name.clone();
        let subtasks = state.subtasks_of(&id);
        let snapshot = record.into_terminal(terminal, result, error, subtasks);
        self.audit(id, &name, action, detail);
        self.retire(&mut state, snapshot);
        self.inner.active_count.send_replace(state.active.len());
        true
    }

    fn cancel_pending(&self, state: &mut SchedulerState, pending: PendingTask, reason: &str) {
        let PendingTask { record, body } = pending;
        drop(body);
        let id = record.id;
        state.release_dependencies(&record.dependencies);
        tracing::info!(task_id = %id, name = %record.name, reason, "queued task canceled");
        self.audit(id, &record.name, AuditAction::Cancel, Some(reason.to_string()));
        state.stats.canceled += 1;
        let subtasks = state.subtasks_of(&id);
        let snapshot = record.into_terminal(TaskState::Canceled, None, None, subtasks);
        self.retire(state, snapshot);
    }

    /// Append a terminal snapshot to history, request admission, and wake
    /// waiters. Evicted tasks lose their bookkeeping, so they no longer satisfy
    /// dependency or parent lookups unless a queued dependent still waits on
    /// them.
    fn retire(&self, state: &mut SchedulerState, snapshot: TaskSnapshot) {
        // Counted before any waiter wakes, so their `settle` covers this pass.
        self.inner.admission.request();
        if let Some(tx) = state.watchers.remove(&snapshot.id) {
            tx.send_replace(Some(snapshot.clone()));
        }
        while state.history.len() >= self.inner.history_capacity {
            let Some(evicted) = state.history.pop_front() else {
                break;
            };
            state.forget(&evicted.id);
        }
        state.history.push_back(snapshot);
    }

    fn audit(&self, id: TaskId, name: &str, action: AuditAction, detail: Option<String>) {
        if let Some(sink) = &self.inner.audit {
            sink.lock().record(build_audit_event(id, name, action, detail));
        }
    }
}

impl<S> std::fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("max_concurrent_tasks", &self.inner.max_concurrent.load(Ordering::Relaxed))
            .field("shutting_down", &self.inner.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn upgrade<S>(handle: &Weak<SchedulerInner<S>>) -> Option<Scheduler<S>> {
    handle.upgrade().map(|inner| Scheduler { inner })
}

/// Allocate every requirement of `record` in order. On any shortfall below a
/// floor, roll back what this call granted and report why.
fn allocate_all(
    pools: &BTreeMap<ResourceKind, Arc<ResourcePool>>,
    record: &TaskRecord,
) -> Result<BTreeMap<ResourceKind, f64>, String> {
    let mut granted: BTreeMap<ResourceKind, f64> = BTreeMap::new();
    let mut touched: Vec<&Arc<ResourcePool>> = Vec::with_capacity(record.requirements.len());
    let rollback = |touched: &[&Arc<ResourcePool>]| {
        for pool in touched {
            pool.release(&record.id);
        }
    };

    for requirement in &record.requirements {
        let Some(pool) = pools.get(&requirement.kind) else {
            rollback(&touched);
            return Err(format!("no pool for `{}`", requirement.kind));
        };
        let floor = requirement.floor();
        if !pool.can_allocate(floor) {
            let available = pool.available();
            rollback(&touched);
            return Err(format!(
                "`{}` has {available:.3} available, needs {floor:.3}",
                requirement.kind
            ));
        }
        let got = pool.allocate(record.id, requirement.requested);
        touched.push(pool);
        if got + EPSILON < floor {
            rollback(&touched);
            return Err(format!(
                "`{}` granted {got:.3}, needs {floor:.3}",
                requirement.kind
            ));
        }
        *granted.entry(requirement.kind.clone()).or_insert(0.0) += got;
    }
    Ok(granted)
}

/// Drive a body until it returns, panics, times out, or is canceled.
async fn execute(
    mut body: Box<dyn TaskBody>,
    ctx: TaskContext,
    control: Arc<TaskControl>,
    timeout: Option<Duration>,
) -> Outcome {
    let run = AssertUnwindSafe(body.run(ctx)).catch_unwind();
    tokio::select! {
        biased;
        result = run => match result {
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(e)) => Outcome::Failed(TaskFailure::Body { message: format!("{e:#}") }),
            Err(payload) => Outcome::Failed(TaskFailure::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        },
        () = control.cancelled() => Outcome::Canceled,
        () = deadline(timeout) => Outcome::Failed(TaskFailure::Timeout {
            elapsed: timeout.unwrap_or_default(),
        }),
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

fn check_amount(amount: f64) -> Result<(), SchedulerError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(SchedulerError::InvalidConfig(format!(
            "reservation amount must be a non-negative finite number, got {amount}"
        )));
    }
    Ok(())
}

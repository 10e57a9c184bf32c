//! Error types for scheduler operations.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::util::serde::{ResourceKind, TaskId};

/// Errors produced synchronously by scheduler components.
///
/// These are configuration and usage errors reported at the call site. Task
/// body failures never surface here; they are recorded on the task as a
/// [`TaskFailure`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A task resource requirement is malformed.
    #[error("invalid requirement for {kind}: {reason}")]
    InvalidRequirement {
        /// Resource kind of the offending requirement.
        kind: ResourceKind,
        /// What was wrong with it.
        reason: String,
    },
    /// No pool is configured for the requested resource kind.
    #[error("no pool configured for resource `{0}`")]
    UnknownResource(ResourceKind),
    /// A dependency names a task this scheduler has never seen.
    #[error("unknown dependency {0}")]
    UnknownDependency(TaskId),
    /// The referenced task does not exist or was evicted from history.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    /// A capacity change would drop below what is already committed.
    #[error("capacity {requested} for `{kind}` is below committed {committed}")]
    CapacityBelowCommitted {
        /// Pool being resized.
        kind: ResourceKind,
        /// Requested capacity.
        requested: f64,
        /// Currently allocated plus reserved.
        committed: f64,
    },
    /// Queue is full.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// The scheduler is shutting down or has shut down.
    #[error("scheduler is shut down")]
    ShutDown,
    /// The blocking worker pool rejected the job because its queue is full.
    #[error("worker pool queue is full")]
    WorkerQueueFull,
    /// The blocking worker pool has been shut down.
    #[error("worker pool has been shut down")]
    WorkerPoolShutdown,
    /// A blocking job panicked on its worker thread.
    #[error("worker job panicked: {0}")]
    WorkerPanicked(String),
    /// Runtime-specific failure with context.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Why a task ended in the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The body returned an error.
    #[error("{message}")]
    Body {
        /// Human-readable error description.
        message: String,
    },
    /// The body panicked.
    #[error("task panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
    /// The body did not finish within its timeout.
    #[error("timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        /// The timeout bound that elapsed.
        elapsed: Duration,
    },
}

impl TaskFailure {
    /// Whether this failure was caused by a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

//! Core scheduling abstractions and capacity accounting.

pub mod audit;
pub mod error;
pub mod executor;
pub mod monitor;
pub(crate) mod queue;
pub mod resource_pool;
pub mod scheduler;
pub mod task;
pub mod worker_pool;

pub use audit::{
    build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, SharedAuditSink,
};
pub use error::{AppResult, SchedulerError, TaskFailure};
pub use executor::{FnBody, Spawn, TaskBody, TaskContext};
pub use monitor::{ConcurrencyController, LoadMonitor, LoadSample, MonitorHandle};
pub use resource_pool::{PoolMetrics, PoolSnapshot, ResourcePool, EPSILON};
pub use scheduler::{AdmissionPredicate, Scheduler, SchedulerStats};
pub use task::{Progress, ResourceRequirement, Task, TaskSnapshot, TaskState, TaskTree};
pub use worker_pool::{WorkerPool, WorkerPoolStats};

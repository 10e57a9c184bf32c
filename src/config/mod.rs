//! Configuration models for the scheduler, its worker threads, and the load monitor.

pub mod monitor;
pub mod scheduler;
pub mod worker_pool;

pub use monitor::MonitorConfig;
pub use scheduler::{SchedulerConfig, ENV_PREFIX};
pub use worker_pool::WorkerPoolConfig;

//! # Prometheus Scheduler
//!
//! A resource-aware priority task scheduler for agent workloads.
//!
//! Tasks declare how much of each finite resource they need (CPU share,
//! memory, API call quota, LLM call slots, browser sessions, or any custom
//! kind) and are admitted from a priority queue only when every requirement
//! can be met, their dependencies have completed, and the concurrency ceiling
//! allows it. Everything a task was granted is released the moment it
//! terminates, which wakes the admission coordinator for the next pass.
//!
//! ## Key Features
//!
//! - **Capacity accounting**: one pool per resource kind; allocations never exceed capacity
//! - **Scalable requirements**: a task can accept any grant between its minimum and its request
//! - **Priority admission**: highest priority first, FIFO within a priority
//! - **Lifecycle control**: cancel, cooperative pause and resume, per-task timeouts
//! - **Subtasks and dependencies**: parent/child trees and completion-gated admission
//! - **Worker threads**: blocking sections run on dedicated OS threads, off the async runtime
//! - **Load monitor**: optional hysteresis controller driving the concurrency ceiling
//!
//! ## Example
//!
//! ```rust,ignore
//! use prometheus_scheduler::config::SchedulerConfig;
//! use prometheus_scheduler::core::{ResourceRequirement, Scheduler, Task};
//! use prometheus_scheduler::util::{Priority, ResourceKind};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::new().with_max_concurrent_tasks(4))?;
//!
//! let id = scheduler.submit(
//!     Task::from_fn("summarize", |ctx| async move {
//!         let share = ctx.granted(&ResourceKind::LlmCall);
//!         ctx.report_progress(0.5);
//!         Ok(serde_json::json!({ "share": share }))
//!     })
//!     .with_priority(Priority::High)
//!     .with_requirement(ResourceRequirement::scalable(ResourceKind::LlmCall, 0.5, 0.2)),
//! )?;
//!
//! let snapshot = scheduler.wait(id).await?;
//! scheduler.shutdown().await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions and capacity accounting.
pub mod core;
/// Configuration models for the scheduler, worker threads, and monitor.
pub mod config;
/// Builders to construct the scheduler from configuration.
pub mod builders;
/// Runtime adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;

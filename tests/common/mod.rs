//! Shared helpers for scheduler integration tests.

#![allow(dead_code)]

use std::time::Duration;

use prometheus_scheduler::config::{SchedulerConfig, WorkerPoolConfig};
use prometheus_scheduler::core::{ResourceRequirement, Scheduler, Task, TaskState};
use prometheus_scheduler::util::{ResourceKind, TaskId};
use serde_json::json;
use tokio::sync::watch;

pub const EPS: f64 = 1e-9;

/// Small config: one worker thread, the given ceiling, default pools.
pub fn config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig::new()
        .with_max_concurrent_tasks(max_concurrent)
        .with_workers(WorkerPoolConfig::new().with_worker_count(1))
}

pub fn scheduler(max_concurrent: usize) -> Scheduler {
    Scheduler::new(config(max_concurrent)).expect("scheduler")
}

/// A latch the test opens to let gated bodies return.
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Task whose body waits for the gate, then returns its own name.
    pub fn task(&self, name: &str) -> Task {
        let mut rx = self.tx.subscribe();
        let name = name.to_string();
        Task::from_fn(name.clone(), move |_ctx| async move {
            loop {
                let open = *rx.borrow_and_update();
                if open || rx.changed().await.is_err() {
                    break;
                }
            }
            Ok(json!(name))
        })
    }

    /// Pausable variant that passes a checkpoint every few milliseconds.
    pub fn pausable_task(&self, name: &str) -> Task {
        let rx = self.tx.subscribe();
        Task::pausable_fn(name, move |ctx| async move {
            loop {
                ctx.checkpoint().await;
                let open = *rx.borrow();
                if open {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            Ok(json!("done"))
        })
    }
}

/// Body that returns immediately.
pub fn quick(name: &str) -> Task {
    let name = name.to_string();
    Task::from_fn(name.clone(), move |_ctx| async move { Ok(json!(name)) })
}

/// Body that never returns on its own.
pub fn forever(name: &str) -> Task {
    Task::from_fn(name, |_ctx| async {
        std::future::pending::<()>().await;
        Ok(serde_json::Value::Null)
    })
}

pub fn cpu(amount: f64) -> ResourceRequirement {
    ResourceRequirement::fixed(ResourceKind::Cpu, amount)
}

pub fn state_of(scheduler: &Scheduler, id: TaskId) -> TaskState {
    scheduler.get_task(id).expect("task known").state
}

pub fn allocated(scheduler: &Scheduler, kind: &ResourceKind) -> f64 {
    scheduler.resource(kind).expect("pool").allocated
}

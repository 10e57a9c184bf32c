//! Tests for the scheduler builder

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prometheus_scheduler::builders::SchedulerBuilder;
use prometheus_scheduler::config::{SchedulerConfig, WorkerPoolConfig};
use prometheus_scheduler::core::{SchedulerError, Spawn, Task, TaskState};
use prometheus_scheduler::util::Priority;

fn config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_max_concurrent_tasks(2)
        .with_workers(WorkerPoolConfig::new().with_worker_count(1))
}

/// Spawner that forwards to the current runtime and counts spawns.
struct CountingSpawner {
    spawned: Arc<AtomicUsize>,
}

impl Spawn for CountingSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(fut);
    }
}

#[tokio::test]
async fn test_builder_builds_with_defaults() {
    let scheduler = SchedulerBuilder::new(config()).build().unwrap();
    assert_eq!(scheduler.max_concurrent_tasks(), 2);
    assert_eq!(scheduler.resource_snapshot().len(), 7);
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let err = SchedulerBuilder::new(config().with_history_capacity(0))
        .build()
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidConfig(_)));
}

#[test]
fn test_builder_outside_runtime_needs_spawner() {
    let err = SchedulerBuilder::new(config()).build().unwrap_err();
    assert!(matches!(err, SchedulerError::Runtime(_)));
}

#[tokio::test]
async fn test_builder_with_custom_spawner_and_predicate() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let scheduler = SchedulerBuilder::new(config())
        .admission_predicate(|task| task.priority != Priority::Background)
        .spawner(CountingSpawner {
            spawned: Arc::clone(&spawned),
        })
        .build_with_spawner()
        .unwrap();

    let id = scheduler
        .submit(Task::from_fn("custom", |_ctx| async { Ok(serde_json::json!(1)) }))
        .unwrap();
    let vetoed = scheduler
        .submit(
            Task::from_fn("vetoed", |_ctx| async { Ok(serde_json::Value::Null) })
                .with_priority(Priority::Background),
        )
        .unwrap();

    assert_eq!(scheduler.wait(id).await.unwrap().state, TaskState::Completed);
    assert_eq!(scheduler.get_task(vetoed).unwrap().state, TaskState::Pending);
    // The admission coordinator plus the one admitted body.
    assert_eq!(spawned.load(Ordering::SeqCst), 2);
}

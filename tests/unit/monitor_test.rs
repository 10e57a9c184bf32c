//! Tests for the load monitor

use std::time::Duration;

use prometheus_scheduler::config::{MonitorConfig, SchedulerConfig, WorkerPoolConfig};
use prometheus_scheduler::core::{
    LoadMonitor, LoadSample, ResourceRequirement, Scheduler, SchedulerError, Task,
};
use prometheus_scheduler::util::ResourceKind;

fn scheduler(max_concurrent: usize) -> Scheduler {
    Scheduler::new(
        SchedulerConfig::new()
            .with_max_concurrent_tasks(max_concurrent)
            .with_workers(WorkerPoolConfig::new().with_worker_count(1)),
    )
    .unwrap()
}

fn idle(name: &str) -> Task {
    Task::from_fn(name, |_ctx| async {
        std::future::pending::<()>().await;
        Ok(serde_json::Value::Null)
    })
}

fn fast_config() -> MonitorConfig {
    MonitorConfig {
        interval_ms: 100,
        stable_samples: 2,
        cooldown_samples: 0,
        min_concurrency: 1,
        max_concurrency: 3,
        ..MonitorConfig::default()
    }
}

#[tokio::test]
async fn test_load_sample_reports_peak_utilization() {
    let scheduler = scheduler(4);
    scheduler
        .submit(idle("cpu").with_requirement(ResourceRequirement::fixed(ResourceKind::Cpu, 0.25)))
        .unwrap();
    scheduler.reserve_capacity(&ResourceKind::Memory, 0.75).unwrap();
    scheduler.settle().await;

    let sample = LoadSample::collect(&scheduler);
    assert!((sample.utilization - 0.75).abs() < 1e-9);
    assert_eq!(sample.active, 1);
    assert_eq!(sample.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_raises_ceiling_when_underutilized() {
    let scheduler = scheduler(1);
    for i in 0..4 {
        scheduler.submit(idle(&format!("idle-{i}"))).unwrap();
    }
    scheduler.settle().await;
    assert_eq!(scheduler.stats().queued, 3);

    let handle = LoadMonitor::spawn(scheduler.clone(), fast_config()).unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;

    assert_eq!(scheduler.max_concurrent_tasks(), 3);
    assert_eq!(scheduler.active_snapshot().len(), 3);
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_monitor_lowers_ceiling_when_saturated() {
    let scheduler = scheduler(3);
    scheduler.reserve_capacity(&ResourceKind::Cpu, 1.0).unwrap();

    let handle = LoadMonitor::spawn(scheduler.clone(), fast_config()).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(scheduler.max_concurrent_tasks(), 2);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(scheduler.max_concurrent_tasks(), 1);
    handle.stop().await;
}

#[tokio::test]
async fn test_monitor_rejects_invalid_config() {
    let scheduler = scheduler(1);
    let config = MonitorConfig {
        interval_ms: 0,
        ..MonitorConfig::default()
    };
    assert!(matches!(
        LoadMonitor::spawn(scheduler, config),
        Err(SchedulerError::InvalidConfig(_))
    ));
}

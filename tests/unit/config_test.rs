//! Tests for configuration validation and loading

use std::time::Duration;

use prometheus_scheduler::config::{MonitorConfig, SchedulerConfig, WorkerPoolConfig};
use prometheus_scheduler::util::ResourceKind;

#[test]
fn test_scheduler_config_defaults() {
    let cfg = SchedulerConfig::default();
    assert_eq!(cfg.max_concurrent_tasks, 10);
    assert_eq!(cfg.history_capacity, 1_000);
    assert_eq!(cfg.max_queue_depth, 10_000);
    assert_eq!(cfg.default_timeout(), None);
    for kind in ResourceKind::BUILTIN {
        assert_eq!(cfg.resources.get(&kind), Some(&1.0));
    }
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_scheduler_config_invalid_values() {
    assert!(SchedulerConfig::new().with_max_concurrent_tasks(0).validate().is_err());
    assert!(SchedulerConfig::new().with_max_queue_depth(0).validate().is_err());
    assert!(SchedulerConfig::new().with_history_capacity(0).validate().is_err());
    assert!(SchedulerConfig::new()
        .with_resource(ResourceKind::Cpu, -1.0)
        .validate()
        .is_err());
    assert!(SchedulerConfig::new()
        .with_resource(ResourceKind::Cpu, f64::NAN)
        .validate()
        .is_err());
    assert!(SchedulerConfig::new()
        .with_workers(WorkerPoolConfig::new().with_worker_count(0))
        .validate()
        .is_err());
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "max_concurrent_tasks": 3,
        "default_timeout_ms": 45000,
        "resources": { "cpu": 2.0, "gpu": 4.0 },
        "workers": { "worker_count": 2 }
    }"#;
    let cfg = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.max_concurrent_tasks, 3);
    assert_eq!(cfg.history_capacity, 1_000);
    assert_eq!(cfg.default_timeout(), Some(Duration::from_secs(45)));
    assert_eq!(cfg.resources.len(), 2);
    assert_eq!(cfg.resources.get(&ResourceKind::Custom("gpu".into())), Some(&4.0));
    assert_eq!(cfg.workers.worker_count, 2);
    assert_eq!(cfg.workers.max_queue_depth, WorkerPoolConfig::default().max_queue_depth);
}

#[test]
fn test_scheduler_config_from_json_rejects_invalid() {
    assert!(SchedulerConfig::from_json_str("{ not json").is_err());
    let err = SchedulerConfig::from_json_str(r#"{ "max_concurrent_tasks": 0 }"#).unwrap_err();
    assert!(err.contains("max_concurrent_tasks"));
}

#[test]
fn test_scheduler_config_json_round_trip_keys() {
    let cfg = SchedulerConfig::new().with_resource(ResourceKind::Custom("vector_db".into()), 0.5);
    let value = serde_json::to_value(&cfg).unwrap();
    assert_eq!(value["resources"]["llm_call"], serde_json::json!(1.0));
    assert_eq!(value["resources"]["vector_db"], serde_json::json!(0.5));
}

#[test]
fn test_scheduler_config_from_vars() {
    let cfg = SchedulerConfig::from_vars([
        ("PROMETHEUS_SCHEDULER_MAX_QUEUE_DEPTH", "64"),
        ("PROMETHEUS_SCHEDULER_WORKER_THREADS", "3"),
        ("PROMETHEUS_SCHEDULER_WORKER_QUEUE_DEPTH", "16"),
        ("PROMETHEUS_SCHEDULER_CAPACITY_BROWSER_SESSION", "4"),
        ("UNRELATED", "1"),
    ])
    .unwrap();
    assert_eq!(cfg.max_queue_depth, 64);
    assert_eq!(cfg.workers.worker_count, 3);
    assert_eq!(cfg.workers.max_queue_depth, 16);
    assert_eq!(cfg.resources.get(&ResourceKind::BrowserSession), Some(&4.0));
}

#[test]
fn test_worker_pool_config_validation() {
    let cfg = WorkerPoolConfig::new();
    assert!(cfg.worker_count >= 1);
    assert!(cfg.validate().is_ok());
    assert!(WorkerPoolConfig::new().with_max_queue_depth(0).validate().is_err());
    assert!(WorkerPoolConfig::new().with_thread_stack_size(0).validate().is_err());
    let cfg = WorkerPoolConfig::new().with_join_timeout(Duration::from_millis(250));
    assert_eq!(cfg.join_timeout(), Duration::from_millis(250));
}

#[test]
fn test_monitor_config_validation() {
    let cfg = MonitorConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.interval(), Duration::from_secs(1));

    let inverted = MonitorConfig {
        low_watermark: 0.9,
        high_watermark: 0.5,
        ..MonitorConfig::default()
    };
    assert!(inverted.validate().is_err());

    let bounds = MonitorConfig {
        min_concurrency: 8,
        max_concurrency: 4,
        ..MonitorConfig::default()
    };
    assert!(bounds.validate().is_err());
}

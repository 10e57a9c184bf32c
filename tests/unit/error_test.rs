//! Tests for error types

use std::time::Duration;

use prometheus_scheduler::core::{SchedulerError, TaskFailure};
use prometheus_scheduler::util::ResourceKind;

#[test]
fn test_scheduler_error_display() {
    let err = SchedulerError::InvalidConfig("max_concurrent_tasks must be greater than 0".into());
    assert_eq!(
        err.to_string(),
        "invalid configuration: max_concurrent_tasks must be greater than 0"
    );

    let err = SchedulerError::UnknownResource(ResourceKind::Custom("gpu".into()));
    assert_eq!(err.to_string(), "no pool configured for resource `gpu`");

    let err = SchedulerError::CapacityBelowCommitted {
        kind: ResourceKind::Cpu,
        requested: 0.5,
        committed: 0.8,
    };
    assert_eq!(err.to_string(), "capacity 0.5 for `cpu` is below committed 0.8");

    assert_eq!(SchedulerError::ShutDown.to_string(), "scheduler is shut down");
}

#[test]
fn test_scheduler_error_converts_to_anyhow() {
    fn fails() -> anyhow::Result<()> {
        let result: Result<(), SchedulerError> = Err(SchedulerError::WorkerQueueFull);
        result?;
        Ok(())
    }
    let err = fails().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::WorkerQueueFull)
    ));
}

#[test]
fn test_task_failure_display_and_kind() {
    let timeout = TaskFailure::Timeout {
        elapsed: Duration::from_millis(1500),
    };
    assert_eq!(timeout.to_string(), "timed out after 1500ms");
    assert!(timeout.is_timeout());

    let panicked = TaskFailure::Panicked {
        message: "index out of bounds".into(),
    };
    assert_eq!(panicked.to_string(), "task panicked: index out of bounds");
    assert!(!panicked.is_timeout());

    let body = TaskFailure::Body {
        message: "rate limited".into(),
    };
    assert_eq!(body.to_string(), "rate limited");
}

#[test]
fn test_task_failure_serializes_with_cause_tag() {
    let value = serde_json::to_value(TaskFailure::Body {
        message: "rate limited".into(),
    })
    .unwrap();
    assert_eq!(value["cause"], "body");
    assert_eq!(value["message"], "rate limited");

    let value = serde_json::to_value(TaskFailure::Timeout {
        elapsed: Duration::from_secs(2),
    })
    .unwrap();
    assert_eq!(value["cause"], "timeout");
}

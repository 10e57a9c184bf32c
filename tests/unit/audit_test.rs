//! Tests for audit sink

use prometheus_scheduler::core::{
    build_audit_event, AuditAction, AuditSink, InMemoryAuditSink, SharedAuditSink,
};
use prometheus_scheduler::util::new_task_id;

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);
    let task_id = new_task_id();

    let event = build_audit_event(task_id, "task1", AuditAction::Submit, Some("queued".to_string()));
    sink.record(event);
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].task_id, task_id);
    assert_eq!(events[0].task_name, "task1");
    assert_eq!(events[0].action, AuditAction::Submit);
    assert_eq!(events[0].detail.as_deref(), Some("queued"));
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);
    let ids = [new_task_id(), new_task_id(), new_task_id()];

    for id in ids {
        sink.record(build_audit_event(id, "t", AuditAction::Submit, None));
    }

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].task_id, ids[1]); // First one popped
    assert_eq!(events[1].task_id, ids[2]);
}

#[test]
fn test_zero_capacity_sink_drops_everything() {
    let mut sink = InMemoryAuditSink::new(0);
    sink.record(build_audit_event(new_task_id(), "t", AuditAction::Admit, None));
    assert!(sink.events().is_empty());
}

#[test]
fn test_build_audit_event() {
    let task_id = new_task_id();
    let event = build_audit_event(task_id, "task1", AuditAction::Timeout, Some("1000ms".to_string()));

    assert_eq!(event.task_id, task_id);
    assert_eq!(event.action, AuditAction::Timeout);
    assert!(event.event_id.contains("timeout"));
    assert!(event.created_at_ms > 0);
    assert_eq!(serde_json::to_value(&event).unwrap()["action"], "timeout");
}

#[test]
fn test_shared_sink_filters_by_task() {
    let sink = SharedAuditSink::new(10);
    let mut writer = sink.clone();
    let a = new_task_id();
    let b = new_task_id();
    writer.record(build_audit_event(a, "a", AuditAction::Submit, None));
    writer.record(build_audit_event(b, "b", AuditAction::Submit, None));
    writer.record(build_audit_event(a, "a", AuditAction::Complete, None));

    let actions: Vec<_> = sink.events_for(&a).iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::Submit, AuditAction::Complete]);
    assert_eq!(sink.events().len(), 3);
}

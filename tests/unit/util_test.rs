//! Tests for shared value types

use std::str::FromStr;

use prometheus_scheduler::util::{new_task_id, now_ms, Priority, ResourceKind};

#[test]
fn test_priority_ordering() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Medium);
    assert!(Priority::Medium > Priority::Low);
    assert!(Priority::Low > Priority::Background);
    assert_eq!(Priority::default(), Priority::Medium);
}

#[test]
fn test_priority_serde_names() {
    assert_eq!(serde_json::to_value(Priority::Critical).unwrap(), "critical");
    let p: Priority = serde_json::from_str("\"background\"").unwrap();
    assert_eq!(p, Priority::Background);
    assert_eq!(Priority::High.to_string(), "high");
}

#[test]
fn test_resource_kind_names() {
    for kind in ResourceKind::BUILTIN {
        assert_eq!(ResourceKind::from(kind.as_str()), kind);
    }
    assert_eq!(ResourceKind::LlmCall.to_string(), "llm_call");
    assert_eq!(
        ResourceKind::from_str("vector_db").unwrap(),
        ResourceKind::Custom("vector_db".into())
    );
    assert_eq!(String::from(ResourceKind::BrowserSession), "browser_session");
}

#[test]
fn test_resource_kind_serde_is_plain_string() {
    assert_eq!(serde_json::to_value(ResourceKind::ApiCall).unwrap(), "api_call");
    let kind: ResourceKind = serde_json::from_str("\"gpu\"").unwrap();
    assert_eq!(kind, ResourceKind::Custom("gpu".into()));
}

#[test]
fn test_task_ids_are_unique() {
    let a = new_task_id();
    let b = new_task_id();
    assert_ne!(a, b);
    assert_eq!(a.get_version_num(), 4);
}

#[test]
fn test_now_ms_is_after_2020() {
    assert!(now_ms() > 1_577_836_800_000);
}

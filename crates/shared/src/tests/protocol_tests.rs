use super::*;

#[test]
fn session_events_are_tagged_with_type_and_payload() {
    let event = SessionEvent::ReconnectScheduled {
        tenant_id: TenantId::new("acme"),
        attempt: 2,
        delay_ms: 10_000,
    };
    let value = serde_json::to_value(&event).expect("json");
    assert_eq!(
        value,
        serde_json::json!({
            "type": "reconnect_scheduled",
            "payload": { "tenant_id": "acme", "attempt": 2, "delay_ms": 10000 }
        })
    );
    assert_eq!(event.tenant_id().as_str(), "acme");
}

#[test]
fn disconnected_event_tolerates_missing_close_code() {
    let event: SessionEvent = serde_json::from_value(serde_json::json!({
        "type": "disconnected",
        "payload": { "tenant_id": "acme", "will_retry": true }
    }))
    .expect("json");
    assert!(matches!(
        event,
        SessionEvent::Disconnected {
            code: None,
            will_retry: true,
            ..
        }
    ));
}

#[test]
fn terminal_reasons_split_into_repairing_and_retiring() {
    assert!(TerminalReason::LoggedOut.requires_repairing());
    assert!(TerminalReason::Superseded.requires_repairing());
    assert!(!TerminalReason::Rejected.requires_repairing());
    assert!(!TerminalReason::Rejected.retires_session());
    assert!(TerminalReason::MaxReconnectAttempts.retires_session());
    assert!(TerminalReason::LeaseLost.retires_session());
}

#[test]
fn unattached_health_entries_omit_connection_fields() {
    let entry = SessionHealth {
        tenant_id: TenantId::new("acme"),
        worker_id: None,
        connection_state: None,
        is_connected: false,
        lock_owned: false,
        last_seen_ms: 0,
        qr_available: false,
        status: HealthStatus::Warning,
        issues: vec![HealthIssue::OrphanedLock],
    };
    let value = serde_json::to_value(&entry).expect("json");
    assert!(value.get("worker_id").is_none());
    assert!(value.get("connection_state").is_none());
    assert_eq!(value["issues"], serde_json::json!(["orphaned_lock"]));
    assert_eq!(ConnectionState::ClosedTransient.as_str(), "closed_transient");
    assert!(ConnectionState::ClosedTerminal.is_closed());
}

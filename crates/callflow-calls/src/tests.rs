//! Unit tests for call persistence.

use callflow_types::{
    AmdResult, CallStatus, FlowType, LegRef, LegStatus, ProviderEvent, TenantTranslationConfig,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::activity::{list_activity, record_activity, ActivityKind};
use crate::error::CallError;
use crate::ledger::{attach_call_id, delivery_count, forget_delivery, record_delivery, LedgerEntry};
use crate::machine::Call;
use crate::store::{find_call_id_by_leg, get_call, insert_call, save_call};
use crate::tenant::{get_tenant_config, load_tenant_config, upsert_tenant_config};

fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    callflow_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-09T12:00:00Z")
        .expect("should parse timestamp")
        .with_timezone(&Utc)
}

fn bridge_call() -> Call {
    let mut call = Call::initiated("c1", "t1", FlowType::Bridge, "agent-leg", now());
    call.agent_number = Some("+15550000001".to_string());
    call.customer_number = Some("+15550000002".to_string());
    call
}

// ── call store ───────────────────────────────────────────────────────

#[test]
fn insert_then_get_round_trips_call_and_legs() {
    let conn = test_db();
    let call = bridge_call();
    insert_call(&conn, &call).expect("insert should succeed");

    let loaded = get_call(&conn, "c1").expect("call should load");
    assert_eq!(loaded, call);
}

#[test]
fn get_unknown_call_is_not_found() {
    let conn = test_db();
    match get_call(&conn, "missing") {
        Err(CallError::NotFound(id)) => assert_eq!(id, "missing"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn save_call_persists_machine_progress() {
    let conn = test_db();
    let mut call = bridge_call();
    insert_call(&conn, &call).expect("insert should succeed");

    call.apply(
        &ProviderEvent::Answered(LegRef {
            call_id: Some("c1".to_string()),
            leg_id: "agent-leg".to_string(),
        }),
        now(),
    );
    call.customer_dial_started("customer-leg");
    call.amd_result = Some(AmdResult::Human);
    save_call(&conn, &call).expect("save should succeed");

    let loaded = get_call(&conn, "c1").expect("call should load");
    assert_eq!(loaded.status, CallStatus::Bridging);
    assert_eq!(loaded.answered_at, Some(now()));
    assert_eq!(loaded.amd_result, Some(AmdResult::Human));
    let agent = loaded.agent_leg.expect("agent leg should exist");
    assert_eq!(agent.status, LegStatus::Answered);
    let customer = loaded.customer_leg.expect("customer leg should exist");
    assert_eq!(customer.leg_id, "customer-leg");
    assert_eq!(customer.status, LegStatus::Dialing);
}

#[test]
fn save_unknown_call_is_not_found() {
    let conn = test_db();
    let call = bridge_call();
    assert!(matches!(
        save_call(&conn, &call),
        Err(CallError::NotFound(_))
    ));
}

#[test]
fn leg_index_resolves_both_legs() {
    let conn = test_db();
    let mut call = bridge_call();
    call.customer_leg = Some(crate::machine::Leg {
        leg_id: "customer-leg".to_string(),
        status: LegStatus::Dialing,
    });
    insert_call(&conn, &call).expect("insert should succeed");

    assert_eq!(
        find_call_id_by_leg(&conn, "agent-leg").expect("lookup should succeed"),
        Some("c1".to_string())
    );
    assert_eq!(
        find_call_id_by_leg(&conn, "customer-leg").expect("lookup should succeed"),
        Some("c1".to_string())
    );
    assert_eq!(
        find_call_id_by_leg(&conn, "nope").expect("lookup should succeed"),
        None
    );
}

// ── ledger ───────────────────────────────────────────────────────────

#[test]
fn ledger_accepts_first_delivery_only() {
    let conn = test_db();
    let entry = LedgerEntry {
        provider_event_id: "evt_1",
        call_id: Some("c1"),
        event_type: "call.answered",
        signature_valid: true,
    };

    assert!(record_delivery(&conn, &entry).expect("insert should succeed"));
    for _ in 0..4 {
        assert!(!record_delivery(&conn, &entry).expect("duplicate should not error"));
    }
    assert_eq!(delivery_count(&conn, "evt_1").expect("count should succeed"), 1);
}

#[test]
fn ledger_call_id_can_be_attached_later() {
    let conn = test_db();
    let entry = LedgerEntry {
        provider_event_id: "evt_init",
        call_id: None,
        event_type: "call.initiated",
        signature_valid: true,
    };
    record_delivery(&conn, &entry).expect("insert should succeed");
    attach_call_id(&conn, "evt_init", "c9").expect("attach should succeed");

    let call_id: Option<String> = conn
        .query_row(
            "SELECT call_id FROM webhook_events WHERE provider_event_id = 'evt_init'",
            [],
            |row| row.get(0),
        )
        .expect("should query ledger");
    assert_eq!(call_id.as_deref(), Some("c9"));
}

#[test]
fn forgotten_delivery_can_be_recorded_again() {
    let conn = test_db();
    let entry = LedgerEntry {
        provider_event_id: "evt_retry",
        call_id: None,
        event_type: "call.ringing",
        signature_valid: true,
    };
    assert!(record_delivery(&conn, &entry).expect("insert should succeed"));
    forget_delivery(&conn, "evt_retry").expect("forget should succeed");
    assert_eq!(delivery_count(&conn, "evt_retry").expect("count should succeed"), 0);
    assert!(record_delivery(&conn, &entry).expect("retry should insert"));
}

// ── activity ─────────────────────────────────────────────────────────

#[test]
fn activity_is_listed_oldest_first_with_limit() {
    let conn = test_db();
    for n in 0..5 {
        record_activity(
            &conn,
            "c1",
            ActivityKind::StatusChanged,
            &serde_json::json!({ "n": n }),
        )
        .expect("record should succeed");
    }
    record_activity(&conn, "other", ActivityKind::Created, &serde_json::json!({}))
        .expect("record should succeed");

    let entries = list_activity(&conn, "c1", 3).expect("list should succeed");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].detail["n"], 0);
    assert_eq!(entries[2].detail["n"], 2);
    assert!(entries.iter().all(|e| e.kind == "status_changed"));
}

// ── tenant config ────────────────────────────────────────────────────

#[test]
fn tenant_config_upsert_replaces_previous_values() {
    let conn = test_db();
    assert!(get_tenant_config(&conn, "t1")
        .expect("lookup should succeed")
        .is_none());

    let mut cfg = TenantTranslationConfig {
        tenant_id: "t1".to_string(),
        translation_enabled: true,
        source_lang: "es".to_string(),
        target_lang: "en".to_string(),
        voice_to_voice: false,
    };
    upsert_tenant_config(&conn, &cfg).expect("upsert should succeed");
    cfg.voice_to_voice = true;
    upsert_tenant_config(&conn, &cfg).expect("second upsert should succeed");

    let stored = get_tenant_config(&conn, "t1")
        .expect("lookup should succeed")
        .expect("config should exist");
    assert_eq!(stored, cfg);
}

#[test]
fn unknown_tenant_loads_disabled_config() {
    let conn = test_db();
    let cfg = load_tenant_config(&conn, "t-new").expect("load should succeed");
    assert_eq!(cfg, TenantTranslationConfig::disabled("t-new"));
}

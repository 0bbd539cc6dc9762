//! Trait contract tests for InvocationLog, RosterStore, QuarantineStore and
//! HistoryStore.
//!
//! Each contract runs against both the in-memory fakes and the filesystem
//! backends. Any conforming implementation must pass these.

use razar_state::fakes::{
    MemoryHistoryStore, MemoryInvocationLog, MemoryQuarantineStore, MemoryRosterStore,
};
use razar_state::*;

fn roster(active: &str, names: &[&str]) -> AgentRoster {
    AgentRoster::new(active, names.iter().map(|n| AgentEntry::new(*n)).collect())
}

// ===========================================================================
// InvocationLog contract
// ===========================================================================

fn invocation_log_contract(log: &dyn InvocationLog) {
    let a = log
        .append(InvocationEvent::new("db", InvocationKind::Handshake).with_agent("crown"))
        .unwrap();
    let b = log
        .append(InvocationEvent::new("api", InvocationKind::Attempt).with_attempt(1))
        .unwrap();
    let c = log
        .append(
            InvocationEvent::new("db", InvocationKind::Attempt)
                .with_attempt(1)
                .with_patched(false),
        )
        .unwrap();

    assert_eq!((a.seq, b.seq, c.seq), (0, 1, 2));
    assert!(a.timestamp < b.timestamp && b.timestamp < c.timestamp);

    let db = log.events_for("db").unwrap();
    assert_eq!(db.len(), 2);
    assert_eq!(db[0].event, InvocationKind::Handshake);
    assert_eq!(db[1].event, InvocationKind::Attempt);
    assert_eq!(log.all().unwrap().len(), 3);
    assert!(log.events_for("cache").unwrap().is_empty());
}

#[test]
fn memory_invocation_log_contract() {
    invocation_log_contract(&MemoryInvocationLog::new());
}

#[test]
fn fs_invocation_log_contract() {
    let dir = tempfile::tempdir().unwrap();
    invocation_log_contract(&FsInvocationLog::new(dir.path().join("events.jsonl")));
}

// ===========================================================================
// RosterStore contract
// ===========================================================================

fn roster_store_contract(store: &dyn RosterStore) {
    assert!(matches!(store.load(), Err(StorageError::NotFound { .. })));
    assert!(!store.restore_backup().unwrap());

    store.save(&roster("crown", &["crown", "coder"])).unwrap();
    store.snapshot_backup().unwrap();

    let mut live = store.load().unwrap();
    live.active = "coder".to_string();
    store.save(&live).unwrap();
    assert_eq!(store.load().unwrap().active, "coder");
    assert_eq!(store.load_backup().unwrap().unwrap().active, "crown");

    assert!(store.restore_backup().unwrap());
    assert_eq!(store.load().unwrap().active, "crown");
}

#[test]
fn memory_roster_store_contract() {
    roster_store_contract(&MemoryRosterStore::new());
}

#[test]
fn fs_roster_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    roster_store_contract(&FsRosterStore::new(dir.path().join("agents.json")));
}

// ===========================================================================
// QuarantineStore contract
// ===========================================================================

fn quarantine_store_contract(store: &dyn QuarantineStore) {
    let record = QuarantineRecord {
        component: "db".to_string(),
        issue_type: IssueType::External,
        fix_note: "connection refused".to_string(),
        diagnostics: None,
        quarantined_at: chrono::Utc::now(),
    };
    store.put_marker(&record).unwrap();
    store.put_marker(&record).unwrap();
    assert_eq!(store.list_markers().unwrap().len(), 1);
    assert_eq!(store.get_marker("db").unwrap().unwrap().fix_note, "connection refused");

    store
        .append_diagnostics(
            "db",
            &DiagnosticsEntry {
                timestamp: chrono::Utc::now(),
                data: serde_json::json!({"port": 5432}),
            },
        )
        .unwrap();
    assert_eq!(store.diagnostics("db").unwrap().len(), 1);
    assert!(store.get_marker("db").unwrap().unwrap().diagnostics.is_none());

    store
        .append_log(&QuarantineLogEntry::new(
            "db",
            QuarantineAction::Quarantined,
            "connection refused",
        ))
        .unwrap();
    assert_eq!(store.log().unwrap().len(), 1);

    assert!(store.remove_marker("db").unwrap());
    assert!(!store.remove_marker("db").unwrap());
    assert!(store.get_marker("db").unwrap().is_none());
}

#[test]
fn memory_quarantine_store_contract() {
    quarantine_store_contract(&MemoryQuarantineStore::new());
}

#[test]
fn fs_quarantine_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    quarantine_store_contract(&FsQuarantineStore::new(
        dir.path().join("quarantine"),
        dir.path().join("quarantine_log.jsonl"),
    ));
}

// ===========================================================================
// HistoryStore contract
// ===========================================================================

fn history_store_contract(store: &dyn HistoryStore) {
    assert_eq!(store.load().unwrap(), BootHistory::default());

    let mut history = BootHistory::default();
    history.component_failures.insert("db".to_string(), 3);
    store.save(&history).unwrap();
    assert_eq!(store.load().unwrap().component_failures["db"], 3);
}

#[test]
fn memory_history_store_contract() {
    history_store_contract(&MemoryHistoryStore::new());
}

#[test]
fn fs_history_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    history_store_contract(&FsHistoryStore::new(dir.path().join("history.json")));
}

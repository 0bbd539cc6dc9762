//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryInvocationLog`, `MemoryRosterStore`,
//! `MemoryQuarantineStore` and `MemoryHistoryStore` that satisfy the trait
//! contracts without touching the filesystem.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::StorageError;
use crate::records::{
    AgentRoster, BootHistory, DiagnosticsEntry, InvocationEvent, QuarantineLogEntry,
    QuarantineRecord,
};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryInvocationLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LogState {
    sequencer: Sequencer,
    events: Vec<InvocationEvent>,
}

/// In-memory invocation log backed by a `Vec`.
#[derive(Debug, Default)]
pub struct MemoryInvocationLog {
    state: Mutex<LogState>,
}

impl MemoryInvocationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InvocationLog for MemoryInvocationLog {
    fn append(&self, event: InvocationEvent) -> StorageResult<InvocationEvent> {
        let mut state = self.state.lock().unwrap();
        let stored = state.sequencer.stamp(event);
        state.events.push(stored.clone());
        Ok(stored)
    }

    fn events_for(&self, component: &str) -> StorageResult<Vec<InvocationEvent>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .iter()
            .filter(|e| e.component == component)
            .cloned()
            .collect())
    }

    fn all(&self) -> StorageResult<Vec<InvocationEvent>> {
        Ok(self.state.lock().unwrap().events.clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryRosterStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RosterState {
    live: Option<AgentRoster>,
    backup: Option<AgentRoster>,
    revision: u64,
}

/// In-memory roster store; every `save` bumps the revision.
#[derive(Debug, Default)]
pub struct MemoryRosterStore {
    state: Mutex<RosterState>,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roster(roster: AgentRoster) -> Self {
        Self {
            state: Mutex::new(RosterState {
                live: Some(roster),
                backup: None,
                revision: 1,
            }),
        }
    }
}

impl RosterStore for MemoryRosterStore {
    fn load(&self) -> StorageResult<AgentRoster> {
        self.state
            .lock()
            .unwrap()
            .live
            .clone()
            .ok_or_else(|| StorageError::NotFound {
                what: "agent roster".to_string(),
            })
    }

    fn save(&self, roster: &AgentRoster) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.live = Some(roster.clone());
        state.revision += 1;
        Ok(())
    }

    fn revision(&self) -> StorageResult<u64> {
        Ok(self.state.lock().unwrap().revision)
    }

    fn snapshot_backup(&self) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let live = state.live.clone().ok_or_else(|| StorageError::NotFound {
            what: "agent roster".to_string(),
        })?;
        state.backup = Some(live);
        Ok(())
    }

    fn load_backup(&self) -> StorageResult<Option<AgentRoster>> {
        Ok(self.state.lock().unwrap().backup.clone())
    }

    fn restore_backup(&self) -> StorageResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.backup.clone() {
            Some(backup) => {
                state.live = Some(backup);
                state.revision += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryQuarantineStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QuarantineState {
    markers: BTreeMap<String, QuarantineRecord>,
    diagnostics: HashMap<String, Vec<DiagnosticsEntry>>,
    log: Vec<QuarantineLogEntry>,
}

/// In-memory quarantine store.
#[derive(Debug, Default)]
pub struct MemoryQuarantineStore {
    state: Mutex<QuarantineState>,
}

impl MemoryQuarantineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuarantineStore for MemoryQuarantineStore {
    fn put_marker(&self, record: &QuarantineRecord) -> StorageResult<()> {
        self.state
            .lock()
            .unwrap()
            .markers
            .insert(record.component.clone(), record.clone());
        Ok(())
    }

    fn get_marker(&self, component: &str) -> StorageResult<Option<QuarantineRecord>> {
        Ok(self.state.lock().unwrap().markers.get(component).cloned())
    }

    fn remove_marker(&self, component: &str) -> StorageResult<bool> {
        Ok(self.state.lock().unwrap().markers.remove(component).is_some())
    }

    fn list_markers(&self) -> StorageResult<Vec<QuarantineRecord>> {
        Ok(self.state.lock().unwrap().markers.values().cloned().collect())
    }

    fn append_diagnostics(&self, component: &str, entry: &DiagnosticsEntry) -> StorageResult<()> {
        self.state
            .lock()
            .unwrap()
            .diagnostics
            .entry(component.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn diagnostics(&self, component: &str) -> StorageResult<Vec<DiagnosticsEntry>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .diagnostics
            .get(component)
            .cloned()
            .unwrap_or_default())
    }

    fn append_log(&self, entry: &QuarantineLogEntry) -> StorageResult<()> {
        self.state.lock().unwrap().log.push(entry.clone());
        Ok(())
    }

    fn log(&self) -> StorageResult<Vec<QuarantineLogEntry>> {
        Ok(self.state.lock().unwrap().log.clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryHistoryStore
// ---------------------------------------------------------------------------

/// In-memory boot history.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    history: Mutex<BootHistory>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: BootHistory) -> Self {
        Self {
            history: Mutex::new(history),
        }
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self) -> StorageResult<BootHistory> {
        Ok(self.history.lock().unwrap().clone())
    }

    fn save(&self, history: &BootHistory) -> StorageResult<()> {
        *self.history.lock().unwrap() = history.clone();
        Ok(())
    }
}

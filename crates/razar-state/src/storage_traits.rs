//! Storage trait definitions for RAZAR
//!
//! These traits define the persistence seams:
//! - `InvocationLog`: append-only remediation history
//! - `RosterStore`: agent roster with a pre-run backup snapshot
//! - `QuarantineStore`: per-component markers plus the quarantine log
//! - `HistoryStore`: boot history document
//!
//! Filesystem backends live in `fs`; in-memory fakes for testing live in
//! `fakes`. Every implementation is internally synchronized, so a shared
//! `Arc<dyn Trait>` may be used from any task.

use chrono::{DateTime, Duration, Utc};

use crate::error::StorageError;
use crate::records::{
    AgentRoster, BootHistory, DiagnosticsEntry, InvocationEvent, QuarantineLogEntry,
    QuarantineRecord,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// InvocationLog
// ---------------------------------------------------------------------------

/// Append-only invocation event log.
///
/// Guarantees:
/// - `append` assigns a `seq` one greater than the previous event.
/// - timestamps are strictly increasing in append order.
/// - `events_for` returns a component's events in append order.
pub trait InvocationLog: Send + Sync {
    /// Append an event and return it as stored.
    fn append(&self, event: InvocationEvent) -> StorageResult<InvocationEvent>;

    /// All events for one component, oldest first.
    fn events_for(&self, component: &str) -> StorageResult<Vec<InvocationEvent>>;

    /// Every event in the log, oldest first.
    fn all(&self) -> StorageResult<Vec<InvocationEvent>>;
}

/// Assigns sequence numbers and strictly increasing timestamps.
#[derive(Debug, Default)]
pub(crate) struct Sequencer {
    last: Option<DateTime<Utc>>,
    next_seq: u64,
}

impl Sequencer {
    pub(crate) fn resume(last: Option<&InvocationEvent>) -> Self {
        match last {
            Some(ev) => Self {
                last: Some(ev.timestamp),
                next_seq: ev.seq + 1,
            },
            None => Self::default(),
        }
    }

    pub(crate) fn stamp(&mut self, mut event: InvocationEvent) -> InvocationEvent {
        let now = Utc::now();
        let ts = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        event.timestamp = ts;
        event.seq = self.next_seq;
        self.last = Some(ts);
        self.next_seq += 1;
        event
    }
}

// ---------------------------------------------------------------------------
// RosterStore
// ---------------------------------------------------------------------------

/// Agent roster persistence.
///
/// `save` replaces the document atomically. `snapshot_backup` copies the
/// current document aside so `restore_backup` can undo a run's escalations.
pub trait RosterStore: Send + Sync {
    /// Load the roster. Returns `StorageError::NotFound` when absent.
    fn load(&self) -> StorageResult<AgentRoster>;

    /// Atomically replace the roster.
    fn save(&self, roster: &AgentRoster) -> StorageResult<()>;

    /// Opaque token that changes whenever the stored roster changes.
    fn revision(&self) -> StorageResult<u64>;

    /// Copy the current roster to the backup slot.
    fn snapshot_backup(&self) -> StorageResult<()>;

    /// Read the backup slot, if any.
    fn load_backup(&self) -> StorageResult<Option<AgentRoster>>;

    /// Restore the backup over the live roster. Returns `false` if no backup exists.
    fn restore_backup(&self) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// QuarantineStore
// ---------------------------------------------------------------------------

/// Quarantine markers, diagnostics and the append-only quarantine log.
pub trait QuarantineStore: Send + Sync {
    /// Write (or overwrite) the marker for `record.component`.
    fn put_marker(&self, record: &QuarantineRecord) -> StorageResult<()>;

    fn get_marker(&self, component: &str) -> StorageResult<Option<QuarantineRecord>>;

    /// Delete a marker. Returns whether one existed.
    fn remove_marker(&self, component: &str) -> StorageResult<bool>;

    /// Current markers sorted by component name.
    fn list_markers(&self) -> StorageResult<Vec<QuarantineRecord>>;

    /// Append diagnostics without touching the marker.
    fn append_diagnostics(&self, component: &str, entry: &DiagnosticsEntry) -> StorageResult<()>;

    fn diagnostics(&self, component: &str) -> StorageResult<Vec<DiagnosticsEntry>>;

    fn append_log(&self, entry: &QuarantineLogEntry) -> StorageResult<()>;

    /// Every log row, oldest first.
    fn log(&self) -> StorageResult<Vec<QuarantineLogEntry>>;
}

// ---------------------------------------------------------------------------
// HistoryStore
// ---------------------------------------------------------------------------

/// Boot history document. A missing document loads as the default.
pub trait HistoryStore: Send + Sync {
    fn load(&self) -> StorageResult<BootHistory>;

    fn save(&self, history: &BootHistory) -> StorageResult<()>;
}

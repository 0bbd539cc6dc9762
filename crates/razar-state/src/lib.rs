//! razar-state: durable records for the RAZAR boot orchestrator
//!
//! This crate owns every byte RAZAR writes to disk: the invocation event
//! log, the agent roster and its pre-run backup, quarantine markers and log,
//! boot history, and the auxiliary JSON-lines logs.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only logs and atomic document replacement. There is no
//! cross-process locking; concurrent writers to one roster must be
//! serialized by the caller.
//!
//! ## Key Components
//!
//! - `storage_traits`: `InvocationLog`, `RosterStore`, `QuarantineStore`, `HistoryStore`
//! - `fs`: filesystem backends plus `JsonlLog` / `JsonDocument`
//! - `fakes`: in-memory implementations for tests

mod error;
pub mod fakes;
pub mod fs;
pub mod records;
pub mod storage_traits;

pub use error::StorageError;
pub use fs::{
    read_json, write_json_atomic, FsHistoryStore, FsInvocationLog, FsQuarantineStore,
    FsRosterStore, JsonDocument, JsonlLog,
};
pub use records::{
    normalize_agent_name, AgentEntry, AgentRoster, BestSequence, BootHistory, BootLogEntry,
    BootState, ComponentRun, DiagnosticsEntry, InvocationEvent, InvocationKind, IssueType,
    LongTaskEntry, PatchRecord, QuarantineAction, QuarantineLogEntry, QuarantineRecord,
    ReactivationMode, RunMetrics, TranscriptEntry, TranscriptRole,
};
pub use storage_traits::{HistoryStore, InvocationLog, QuarantineStore, RosterStore, StorageResult};

//! Filesystem backends.
//!
//! Documents are replaced atomically (temp file in the same directory, then
//! rename). Logs are JSON-lines files appended under an in-process lock.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::records::{
    AgentRoster, BootHistory, DiagnosticsEntry, InvocationEvent, QuarantineLogEntry,
    QuarantineRecord,
};
use crate::storage_traits::{
    HistoryStore, InvocationLog, QuarantineStore, RosterStore, Sequencer, StorageResult,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn ensure_parent(path: &Path) -> StorageResult<PathBuf> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    Ok(parent)
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> StorageResult<()> {
    let parent = ensure_parent(path)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a JSON document. Returns `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Generic JSON-lines log and JSON document
// ---------------------------------------------------------------------------

/// Append-only JSON-lines file.
#[derive(Debug)]
pub struct JsonlLog {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line.
    pub fn append<T: Serialize + ?Sized>(&self, record: &T) -> StorageResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let _held = lock(&self.guard);
        ensure_parent(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    /// Read every well-formed line. Malformed lines are skipped with a warning.
    pub fn read_all<T: DeserializeOwned>(&self) -> StorageResult<Vec<T>> {
        let _held = lock(&self.guard);
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => out.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping malformed log line"
                ),
            }
        }
        Ok(out)
    }
}

/// A single JSON document that loads as `T::default()` when absent.
#[derive(Debug)]
pub struct JsonDocument<T> {
    path: PathBuf,
    guard: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> StorageResult<T> {
        let _held = lock(&self.guard);
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, value: &T) -> StorageResult<()> {
        let _held = lock(&self.guard);
        write_json_atomic(&self.path, value)
    }

    /// Read-modify-write under the document lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> StorageResult<R> {
        let _held = lock(&self.guard);
        let mut value: T = read_json(&self.path)?.unwrap_or_default();
        let out = f(&mut value);
        write_json_atomic(&self.path, &value)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// FsInvocationLog
// ---------------------------------------------------------------------------

/// Invocation events in a JSON-lines file.
#[derive(Debug)]
pub struct FsInvocationLog {
    log: JsonlLog,
    sequencer: Mutex<Option<Sequencer>>,
}

impl FsInvocationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            log: JsonlLog::new(path),
            sequencer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }
}

impl InvocationLog for FsInvocationLog {
    fn append(&self, event: InvocationEvent) -> StorageResult<InvocationEvent> {
        let mut sequencer = lock(&self.sequencer);
        if sequencer.is_none() {
            let existing: Vec<InvocationEvent> = self.log.read_all()?;
            *sequencer = Some(Sequencer::resume(existing.last()));
        }
        let stored = sequencer.get_or_insert_with(Sequencer::default).stamp(event);
        self.log.append(&stored)?;
        Ok(stored)
    }

    fn events_for(&self, component: &str) -> StorageResult<Vec<InvocationEvent>> {
        let mut events: Vec<InvocationEvent> = self
            .log
            .read_all::<InvocationEvent>()?
            .into_iter()
            .filter(|e| e.component == component)
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        Ok(events)
    }

    fn all(&self) -> StorageResult<Vec<InvocationEvent>> {
        self.log.read_all()
    }
}

// ---------------------------------------------------------------------------
// FsRosterStore
// ---------------------------------------------------------------------------

/// Roster JSON file with a sibling `<file>.bak` backup.
#[derive(Debug)]
pub struct FsRosterStore {
    path: PathBuf,
    backup_path: PathBuf,
    guard: Mutex<()>,
}

impl FsRosterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut backup = path.clone().into_os_string();
        backup.push(".bak");
        Self {
            path,
            backup_path: PathBuf::from(backup),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }
}

impl RosterStore for FsRosterStore {
    fn load(&self) -> StorageResult<AgentRoster> {
        let _held = lock(&self.guard);
        read_json(&self.path)?.ok_or_else(|| StorageError::NotFound {
            what: format!("agent roster {}", self.path.display()),
        })
    }

    fn save(&self, roster: &AgentRoster) -> StorageResult<()> {
        let _held = lock(&self.guard);
        write_json_atomic(&self.path, roster)
    }

    fn revision(&self) -> StorageResult<u64> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let nanos = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(nanos ^ meta.len().rotate_left(32))
    }

    fn snapshot_backup(&self) -> StorageResult<()> {
        let _held = lock(&self.guard);
        let roster: AgentRoster = read_json(&self.path)?.ok_or_else(|| StorageError::NotFound {
            what: format!("agent roster {}", self.path.display()),
        })?;
        write_json_atomic(&self.backup_path, &roster)
    }

    fn load_backup(&self) -> StorageResult<Option<AgentRoster>> {
        let _held = lock(&self.guard);
        read_json(&self.backup_path)
    }

    fn restore_backup(&self) -> StorageResult<bool> {
        let _held = lock(&self.guard);
        match read_json::<AgentRoster>(&self.backup_path)? {
            Some(roster) => {
                write_json_atomic(&self.path, &roster)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// FsQuarantineStore
// ---------------------------------------------------------------------------

/// Markers as `<dir>/<component>.json`, diagnostics as
/// `<dir>/<component>.diagnostics.jsonl`, plus one shared log file.
#[derive(Debug)]
pub struct FsQuarantineStore {
    dir: PathBuf,
    log: JsonlLog,
}

impl FsQuarantineStore {
    pub fn new(dir: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            log: JsonlLog::new(log_path),
        }
    }

    fn file_stem(component: &str) -> String {
        component
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect()
    }

    pub fn marker_path(&self, component: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::file_stem(component)))
    }

    fn diagnostics_log(&self, component: &str) -> JsonlLog {
        JsonlLog::new(
            self.dir
                .join(format!("{}.diagnostics.jsonl", Self::file_stem(component))),
        )
    }
}

impl QuarantineStore for FsQuarantineStore {
    fn put_marker(&self, record: &QuarantineRecord) -> StorageResult<()> {
        write_json_atomic(&self.marker_path(&record.component), record)
    }

    fn get_marker(&self, component: &str) -> StorageResult<Option<QuarantineRecord>> {
        read_json(&self.marker_path(component))
    }

    fn remove_marker(&self, component: &str) -> StorageResult<bool> {
        match fs::remove_file(self.marker_path(component)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_markers(&self) -> StorageResult<Vec<QuarantineRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut markers = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_json::<QuarantineRecord>(&path)? {
                markers.push(record);
            }
        }
        markers.sort_by(|a, b| a.component.cmp(&b.component));
        Ok(markers)
    }

    fn append_diagnostics(&self, component: &str, entry: &DiagnosticsEntry) -> StorageResult<()> {
        self.diagnostics_log(component).append(entry)
    }

    fn diagnostics(&self, component: &str) -> StorageResult<Vec<DiagnosticsEntry>> {
        self.diagnostics_log(component).read_all()
    }

    fn append_log(&self, entry: &QuarantineLogEntry) -> StorageResult<()> {
        self.log.append(entry)
    }

    fn log(&self) -> StorageResult<Vec<QuarantineLogEntry>> {
        self.log.read_all()
    }
}

// ---------------------------------------------------------------------------
// FsHistoryStore
// ---------------------------------------------------------------------------

/// Boot history as a single JSON document.
#[derive(Debug)]
pub struct FsHistoryStore {
    doc: JsonDocument<BootHistory>,
}

impl FsHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            doc: JsonDocument::new(path),
        }
    }
}

impl HistoryStore for FsHistoryStore {
    fn load(&self) -> StorageResult<BootHistory> {
        self.doc.load()
    }

    fn save(&self, history: &BootHistory) -> StorageResult<()> {
        self.doc.save(history)
    }
}

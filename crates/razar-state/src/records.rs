//! Persistent record shapes shared by every RAZAR store.
//!
//! All records are plain serde structs; stores decide where they live.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Invocation events
// ---------------------------------------------------------------------------

/// Kind of an invocation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    /// Mission brief exchange with the supervisory peer failed.
    Handshake,
    /// Control moved to the secondary supervisory agent.
    Fallback,
    /// One remediation handover.
    Attempt,
    /// The active agent advanced along the ladder.
    Escalation,
}

impl InvocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationKind::Handshake => "handshake",
            InvocationKind::Fallback => "fallback",
            InvocationKind::Attempt => "attempt",
            InvocationKind::Escalation => "escalation",
        }
    }
}

/// Append-only record of one step in a component's remediation history.
///
/// The log assigns `seq` and a strictly increasing `timestamp` on append, so
/// events for a component form a total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEvent {
    /// Position in the log (assigned on append)
    #[serde(default)]
    pub seq: u64,
    pub component: String,
    pub event: InvocationKind,
    /// Lower-cased agent name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Agent name as spelled in the roster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patched: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

impl InvocationEvent {
    pub fn new(component: impl Into<String>, event: InvocationKind) -> Self {
        Self {
            seq: 0,
            component: component.into(),
            event,
            agent: None,
            agent_original: None,
            error: None,
            attempt: None,
            patched: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach an agent, keeping both the normalized and original spelling.
    pub fn with_agent(mut self, name: &str) -> Self {
        self.agent = Some(normalize_agent_name(name));
        self.agent_original = Some(name.to_string());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_patched(mut self, patched: bool) -> Self {
        self.patched = Some(patched);
        self
    }
}

// ---------------------------------------------------------------------------
// Agent roster
// ---------------------------------------------------------------------------

/// Canonical form used for agent name comparisons.
pub fn normalize_agent_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// One configured remediation agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Environment variable holding the live secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
    /// `${VAR}` reference or rotation placeholder; never a live secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    /// Fields this crate does not interpret, preserved across rewrites
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AgentEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            credential_env: None,
            credential: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credential_env(mut self, var: impl Into<String>) -> Self {
        self.credential_env = Some(var.into());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Whether the agent needs a resolved secret before it may be called.
    pub fn requires_credential(&self) -> bool {
        self.credential_env.is_some() || self.credential.is_some()
    }
}

/// Versioned roster document. Order of `agents` is the escalation ladder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentRoster {
    pub active: String,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

impl AgentRoster {
    pub fn new(active: impl Into<String>, agents: Vec<AgentEntry>) -> Self {
        Self {
            active: active.into(),
            agents,
        }
    }

    /// Ladder position of `name`, compared case-insensitively.
    pub fn position(&self, name: &str) -> Option<usize> {
        let wanted = normalize_agent_name(name);
        self.agents
            .iter()
            .position(|a| normalize_agent_name(&a.name) == wanted)
    }

    pub fn find(&self, name: &str) -> Option<&AgentEntry> {
        self.position(name).map(|i| &self.agents[i])
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut AgentEntry> {
        match self.position(name) {
            Some(i) => self.agents.get_mut(i),
            None => None,
        }
    }

    pub fn active_index(&self) -> Option<usize> {
        self.position(&self.active)
    }

    pub fn active_entry(&self) -> Option<&AgentEntry> {
        self.find(&self.active)
    }
}

// ---------------------------------------------------------------------------
// Quarantine
// ---------------------------------------------------------------------------

/// Coarse cause of a quarantined component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Dependency,
    Logic,
    External,
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IssueType::Dependency => "dependency",
            IssueType::Logic => "logic",
            IssueType::External => "external",
        };
        f.write_str(s)
    }
}

/// Marker written for a quarantined component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub component: String,
    pub issue_type: IssueType,
    pub fix_note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
    pub quarantined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineAction {
    Quarantined,
    Diagnostics,
    Reactivated,
}

/// How a reactivation was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactivationMode {
    Auto,
    Manual,
}

/// One row of the quarantine log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineLogEntry {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub action: QuarantineAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ReactivationMode>,
    #[serde(default)]
    pub details: String,
}

impl QuarantineLogEntry {
    pub fn new(component: impl Into<String>, action: QuarantineAction, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            action,
            mode: None,
            details: details.into(),
        }
    }
}

/// Diagnostics appended to a quarantined component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsEntry {
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Boot history
// ---------------------------------------------------------------------------

/// Outcome of one component within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRun {
    pub name: String,
    pub attempts: u32,
    pub success: bool,
}

/// Aggregate snapshot computed once per boot run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub timestamp: DateTime<Utc>,
    pub components: Vec<ComponentRun>,
    pub success_rate: f64,
    /// Wall time of the run in seconds
    pub total_time: f64,
    pub component_attempts: u32,
    pub retries: u32,
    #[serde(default)]
    pub first_attempt_successes: u32,
}

impl RunMetrics {
    pub fn successes(&self) -> usize {
        self.components.iter().filter(|c| c.success).count()
    }

    pub fn failures(&self) -> u32 {
        self.components.iter().filter(|c| !c.success).count() as u32
    }
}

/// Best run observed so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestSequence {
    pub components: Vec<String>,
    pub success_rate: f64,
    pub total_time: f64,
    #[serde(default)]
    pub failures: u32,
    pub timestamp: DateTime<Utc>,
}

/// Boot history document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BootHistory {
    #[serde(default)]
    pub history: Vec<RunMetrics>,
    #[serde(default)]
    pub best_sequence: Option<BestSequence>,
    #[serde(default)]
    pub component_failures: BTreeMap<String, u32>,
}

// ---------------------------------------------------------------------------
// Auxiliary logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    Razar,
    Crown,
}

/// One side of the Crown dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub message: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// One patch attempt against a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub component: String,
    pub module: String,
    pub attempt: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One iteration of an unbounded remediation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTaskEntry {
    pub component: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub patched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub aborted: bool,
    pub timestamp: DateTime<Utc>,
}

/// Boot lifecycle step written to the state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootLogEntry {
    pub timestamp: DateTime<Utc>,
    pub step: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Orchestrator state document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BootState {
    #[serde(default)]
    pub events: Vec<BootLogEntry>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub downtime: serde_json::Value,
    #[serde(default)]
    pub launched_models: Vec<String>,
    #[serde(default)]
    pub last_handshake: Option<DateTime<Utc>>,
}

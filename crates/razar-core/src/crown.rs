//! Crown mission-brief handshake.
//!
//! One brief goes out over a WebSocket and exactly one reply comes back.
//! Both sides are archived under the mission brief directory and appended to
//! the role-tagged transcript. Downtime entries in the reply are turned into
//! recovery requests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

use razar_state::{write_json_atomic, JsonlLog, StorageError, TranscriptEntry, TranscriptRole};

use crate::domain::BootConfig;
use crate::obs;
use crate::recovery::{PatchInfo, RecoveryManager};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("crown url is not configured (set CROWN_WS_URL)")]
    MissingUrl,

    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("crown protocol error: {0}")]
    Protocol(String),

    #[error("crown handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type HandshakeResult<T> = std::result::Result<T, HandshakeError>;

/// Brief sent to Crown before the boot loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionBrief {
    pub priority_map: BTreeMap<String, usize>,
    #[serde(default)]
    pub current_status: BTreeMap<String, String>,
    #[serde(default)]
    pub open_issues: Vec<String>,
}

impl MissionBrief {
    /// Priority map in launch order; quarantined components become open issues.
    pub fn for_config(config: &BootConfig, quarantined: &[String]) -> Self {
        let mut brief = MissionBrief::default();
        for def in &config.components {
            brief.priority_map.insert(def.name.clone(), def.priority);
            let status = if quarantined.contains(&def.name) {
                "quarantined"
            } else {
                "pending"
            };
            brief
                .current_status
                .insert(def.name.clone(), status.to_string());
        }
        brief.open_issues = quarantined.to_vec();
        brief
    }
}

/// Crown's reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrownResponse {
    #[serde(default, alias = "acknowledgement")]
    pub ack: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub downtime: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
}

/// Strip `-` and upper-case, so `glm-4v` and `GLM4V` compare equal.
pub fn normalize_capability(name: &str) -> String {
    name.replace('-', "").to_uppercase()
}

/// Whether any advertised capability starts with the required one.
pub fn has_capability(advertised: &[String], required: &str) -> bool {
    let wanted = normalize_capability(required);
    advertised
        .iter()
        .any(|c| normalize_capability(c).starts_with(&wanted))
}

/// Identity fingerprints are objects; anything else is wrapped as `{"value": ...}`.
pub fn normalize_identity(raw: Value) -> Value {
    match raw {
        Value::Object(_) => raw,
        Value::String(s) => json!({ "value": s }),
        other => json!({ "value": other.to_string() }),
    }
}

/// One request/response exchange with Crown.
#[async_trait]
pub trait CrownTransport: Send + Sync {
    async fn exchange(&self, brief: String) -> HandshakeResult<String>;
}

/// WebSocket transport; connect, send and receive share one timeout.
pub struct WsCrownTransport {
    url: String,
    timeout: Duration,
}

impl WsCrownTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    /// Transport for `url`, or [`HandshakeError::MissingUrl`] when unset.
    pub fn from_url(url: Option<&str>, timeout: Duration) -> HandshakeResult<Self> {
        match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(u) => Ok(Self::new(u, timeout)),
            None => Err(HandshakeError::MissingUrl),
        }
    }

    async fn round_trip(&self, brief: String) -> HandshakeResult<String> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| HandshakeError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        ws.send(Message::Text(brief))
            .await
            .map_err(|e| HandshakeError::Protocol(format!("send failed: {e}")))?;

        while let Some(frame) = ws.next().await {
            let frame =
                frame.map_err(|e| HandshakeError::Protocol(format!("receive failed: {e}")))?;
            let reply = match frame {
                Message::Text(text) => text,
                Message::Binary(bytes) => String::from_utf8(bytes)
                    .map_err(|e| HandshakeError::Protocol(format!("binary reply: {e}")))?,
                Message::Close(_) => break,
                _ => continue,
            };
            if let Err(e) = ws.close(None).await {
                tracing::debug!(error = %e, "crown socket close failed");
            }
            return Ok(reply);
        }
        Err(HandshakeError::Protocol(
            "connection closed before reply".to_string(),
        ))
    }
}

#[async_trait]
impl CrownTransport for WsCrownTransport {
    async fn exchange(&self, brief: String) -> HandshakeResult<String> {
        tokio::time::timeout(self.timeout, self.round_trip(brief))
            .await
            .map_err(|_| HandshakeError::Timeout(self.timeout))?
    }
}

fn archive_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

/// Performs the handshake and keeps the archive and transcript.
pub struct CrownHandshake {
    transport: Arc<dyn CrownTransport>,
    transcript: Arc<JsonlLog>,
    archive_dir: PathBuf,
    recovery: RecoveryManager,
    identity: Option<Value>,
    max_briefs: usize,
}

impl CrownHandshake {
    pub fn new(
        transport: Arc<dyn CrownTransport>,
        transcript: Arc<JsonlLog>,
        archive_dir: impl Into<PathBuf>,
        recovery: RecoveryManager,
    ) -> Self {
        Self {
            transport,
            transcript,
            archive_dir: archive_dir.into(),
            recovery,
            identity: None,
            max_briefs: crate::settings::DEFAULT_MAX_MISSION_BRIEFS,
        }
    }

    pub fn with_identity(mut self, identity: Option<Value>) -> Self {
        self.identity = identity.map(normalize_identity);
        self
    }

    pub fn with_max_briefs(mut self, max_briefs: usize) -> Self {
        self.max_briefs = max_briefs;
        self
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Send `brief`, await the reply and act on its downtime entries.
    pub async fn perform(&self, brief: &MissionBrief) -> HandshakeResult<CrownResponse> {
        let stamp = archive_stamp();
        let brief_value = serde_json::to_value(brief)?;
        write_json_atomic(&self.archive_dir.join(format!("{stamp}.json")), &brief_value)?;
        self.transcript.append(&TranscriptEntry {
            role: TranscriptRole::Razar,
            message: brief_value.clone(),
            identity: None,
            timestamp: Utc::now(),
        })?;

        let raw = self.transport.exchange(brief_value.to_string()).await?;
        let reply: Value = serde_json::from_str(&raw)
            .map_err(|e| HandshakeError::Protocol(format!("reply is not JSON: {e}")))?;
        if !reply.is_object() {
            return Err(HandshakeError::Protocol(
                "reply is not a JSON object".to_string(),
            ));
        }
        let mut response: CrownResponse = serde_json::from_value(reply.clone())
            .map_err(|e| HandshakeError::Protocol(format!("malformed reply: {e}")))?;
        response.identity = self.identity.clone();

        self.transcript.append(&TranscriptEntry {
            role: TranscriptRole::Crown,
            message: reply,
            identity: self.identity.clone(),
            timestamp: Utc::now(),
        })?;
        write_json_atomic(
            &self.archive_dir.join(format!("{stamp}_response.json")),
            &response,
        )?;

        self.process_downtime(&stamp, &response.downtime)?;
        self.rotate_archive()?;
        obs::emit_handshake("success", &response.ack);
        Ok(response)
    }

    /// Shutdown, optional patch, resume for every downtime entry.
    fn process_downtime(&self, stamp: &str, downtime: &Map<String, Value>) -> HandshakeResult<()> {
        for (component, patch) in downtime {
            self.recovery.request_shutdown(component)?;
            if is_truthy(patch) {
                self.recovery
                    .apply_patch(component, &PatchInfo::from_value(patch))?;
                let safe = component.replace(['/', '\\'], "_");
                write_json_atomic(
                    &self.archive_dir.join(format!("{stamp}_{safe}_patch.json")),
                    &json!({ "component": component, "patch": patch }),
                )?;
            }
            self.recovery.resume(component)?;
        }
        Ok(())
    }

    /// Archive an out-of-band brief/response pair, e.g. a model launch.
    pub fn archive_pair(&self, label: &str, brief: &Value, response: &Value) -> HandshakeResult<()> {
        let stamp = archive_stamp();
        write_json_atomic(&self.archive_dir.join(format!("{stamp}_{label}.json")), brief)?;
        write_json_atomic(
            &self.archive_dir.join(format!("{stamp}_{label}_response.json")),
            response,
        )?;
        self.rotate_archive()
    }

    /// Keep the newest `max_briefs` brief/response pairs. Downtime patch
    /// records go with the brief that produced them.
    pub fn rotate_archive(&self) -> HandshakeResult<()> {
        let entries = match std::fs::read_dir(&self.archive_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::from(e).into()),
        };
        let names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".json"))
            .collect();
        let mut briefs: Vec<&String> = names
            .iter()
            .filter(|n| !n.ends_with("_response.json") && !n.ends_with("_patch.json"))
            .collect();
        if briefs.len() <= self.max_briefs {
            return Ok(());
        }
        briefs.sort();
        let excess = briefs.len() - self.max_briefs;
        for name in briefs.into_iter().take(excess) {
            let stem = name.trim_end_matches(".json");
            let patches = names
                .iter()
                .filter(|n| n.starts_with(&format!("{stem}_")) && n.ends_with("_patch.json"))
                .cloned();
            for file in [name.clone(), format!("{stem}_response.json")]
                .into_iter()
                .chain(patches)
            {
                match std::fs::remove_file(self.archive_dir.join(&file)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StorageError::from(e).into()),
                }
            }
        }
        Ok(())
    }
}

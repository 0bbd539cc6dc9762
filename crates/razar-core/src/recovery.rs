//! Recovery requests raised by Crown downtime entries.
//!
//! Each request is a small JSON document `<component>_<action>.json` under
//! the recovery directory; the component's supervisor picks it up from there.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use razar_state::{write_json_atomic, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Shutdown,
    Patch,
    Resume,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Shutdown => "shutdown",
            RecoveryAction::Patch => "patch",
            RecoveryAction::Resume => "resume",
        }
    }
}

/// Patch details carried by a downtime entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
}

impl PatchInfo {
    /// Read patch details from a downtime value; a bare string is the description.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self {
                description: s.clone(),
                ..Self::default()
            },
            Value::Object(map) => {
                let nested = map.get("patch").filter(|p| p.is_object());
                match nested {
                    Some(p) => serde_json::from_value(p.clone()).unwrap_or_default(),
                    None => serde_json::from_value(value.clone()).unwrap_or_default(),
                }
            }
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub component: String,
    pub action: RecoveryAction,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Writes recovery requests for supervised components.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    dir: PathBuf,
}

impl RecoveryManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn request_path(&self, component: &str, action: RecoveryAction) -> PathBuf {
        let safe = component.replace(['/', '\\'], "_");
        self.dir.join(format!("{safe}_{}.json", action.as_str()))
    }

    fn write(&self, component: &str, action: RecoveryAction, data: Value) -> StorageResult<PathBuf> {
        let request = RecoveryRequest {
            component: component.to_string(),
            action,
            data,
            timestamp: Utc::now(),
        };
        let path = self.request_path(component, action);
        write_json_atomic(&path, &request)?;
        tracing::info!(component = %component, action = action.as_str(), "recovery request written");
        Ok(path)
    }

    pub fn request_shutdown(&self, component: &str) -> StorageResult<PathBuf> {
        self.write(component, RecoveryAction::Shutdown, Value::Null)
    }

    pub fn apply_patch(&self, component: &str, patch: &PatchInfo) -> StorageResult<PathBuf> {
        self.write(component, RecoveryAction::Patch, serde_json::to_value(patch)?)
    }

    pub fn resume(&self, component: &str) -> StorageResult<PathBuf> {
        self.write(component, RecoveryAction::Resume, Value::Null)
    }

    /// Shutdown, patch, resume in that order.
    pub fn recover(&self, component: &str, patch: &PatchInfo) -> StorageResult<Vec<PathBuf>> {
        Ok(vec![
            self.request_shutdown(component)?,
            self.apply_patch(component, patch)?,
            self.resume(component)?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_writes_three_requests() {
        let dir = tempfile::tempdir().unwrap();
        let rm = RecoveryManager::new(dir.path());
        let info = PatchInfo::from_value(&serde_json::json!({"patch": {"description": "bump pool"}}));
        let paths = rm.recover("memory", &info).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(dir.path().join("memory_shutdown.json").exists());
        assert!(dir.path().join("memory_resume.json").exists());

        let raw = std::fs::read_to_string(dir.path().join("memory_patch.json")).unwrap();
        let req: RecoveryRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(req.action, RecoveryAction::Patch);
        assert_eq!(req.data["description"], "bump pool");
    }

    #[test]
    fn bare_string_is_description() {
        let info = PatchInfo::from_value(&Value::String("restart".into()));
        assert_eq!(info.description, "restart");
        assert!(info.tests.is_empty());
    }
}

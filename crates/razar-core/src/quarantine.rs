//! Quarantine manager: markers, diagnostics and the quarantine log.
//!
//! Reactivation is gated on `verified == true`; nothing else ever removes a
//! marker.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use razar_state::{
    DiagnosticsEntry, IssueType, QuarantineAction, QuarantineLogEntry, QuarantineRecord,
    QuarantineStore, ReactivationMode,
};

use crate::domain::{RazarError, Result};
use crate::obs;

/// Classify an error message into a coarse issue type.
pub fn classify_issue(error: &str) -> IssueType {
    let msg = error.to_lowercase();

    const DEPENDENCY: [&str; 7] = [
        "importerror",
        "modulenotfounderror",
        "no module named",
        "dependencyerror",
        "cannot import",
        "command not found",
        "no such file or directory",
    ];
    const LOGIC: [&str; 8] = [
        "assertionerror",
        "typeerror",
        "valueerror",
        "keyerror",
        "indexerror",
        "attributeerror",
        "panicked",
        "assertion failed",
    ];

    if DEPENDENCY.iter().any(|k| msg.contains(k)) {
        return IssueType::Dependency;
    }
    if LOGIC.iter().any(|k| msg.contains(k)) {
        return IssueType::Logic;
    }
    IssueType::External
}

/// Operator-facing hint for an issue type.
pub fn remediation_hint(issue: IssueType) -> &'static str {
    match issue {
        IssueType::Dependency => "install or pin the missing dependency",
        IssueType::Logic => "review the failing code path and its tests",
        IssueType::External => "check the upstream service, network or credentials",
    }
}

/// State transitions over a [`QuarantineStore`].
#[derive(Clone)]
pub struct QuarantineManager {
    store: Arc<dyn QuarantineStore>,
}

impl QuarantineManager {
    pub fn new(store: Arc<dyn QuarantineStore>) -> Self {
        Self { store }
    }

    /// Write the marker and append a `quarantined` row. Safe to repeat.
    pub fn quarantine(
        &self,
        component: &str,
        issue_type: IssueType,
        fix_note: &str,
        diagnostics: Option<Value>,
    ) -> Result<QuarantineRecord> {
        let record = QuarantineRecord {
            component: component.to_string(),
            issue_type,
            fix_note: fix_note.to_string(),
            diagnostics,
            quarantined_at: Utc::now(),
        };
        self.store.put_marker(&record)?;
        self.store.append_log(&QuarantineLogEntry::new(
            component,
            QuarantineAction::Quarantined,
            format!("{issue_type}: {fix_note}"),
        ))?;
        obs::emit_quarantined(component, &issue_type.to_string());
        Ok(record)
    }

    /// Append diagnostics without altering the marker.
    pub fn record_diagnostics(&self, component: &str, data: Value) -> Result<()> {
        let summary = data.to_string();
        self.store.append_diagnostics(
            component,
            &DiagnosticsEntry {
                timestamp: Utc::now(),
                data,
            },
        )?;
        self.store.append_log(&QuarantineLogEntry::new(
            component,
            QuarantineAction::Diagnostics,
            summary,
        ))?;
        Ok(())
    }

    /// Remove the marker. Always fails unless `verified` is true.
    pub fn reactivate(
        &self,
        component: &str,
        verified: bool,
        automated: bool,
        note: Option<&str>,
    ) -> Result<()> {
        if !verified {
            return Err(RazarError::QuarantineState {
                component: component.to_string(),
                reason: "reactivation requires verified=true".to_string(),
            });
        }
        let existed = self.store.remove_marker(component)?;
        if !existed {
            tracing::debug!(component = %component, "reactivating component with no marker");
        }
        let mut entry = QuarantineLogEntry::new(
            component,
            QuarantineAction::Reactivated,
            note.unwrap_or_default(),
        );
        entry.mode = Some(if automated {
            ReactivationMode::Auto
        } else {
            ReactivationMode::Manual
        });
        self.store.append_log(&entry)?;
        obs::emit_reactivated(component, automated);
        Ok(())
    }

    pub fn is_quarantined(&self, component: &str) -> Result<bool> {
        Ok(self.store.get_marker(component)?.is_some())
    }

    pub fn get(&self, component: &str) -> Result<Option<QuarantineRecord>> {
        Ok(self.store.get_marker(component)?)
    }

    pub fn list(&self) -> Result<Vec<QuarantineRecord>> {
        Ok(self.store.list_markers()?)
    }

    pub fn diagnostics(&self, component: &str) -> Result<Vec<DiagnosticsEntry>> {
        Ok(self.store.diagnostics(component)?)
    }

    pub fn log(&self) -> Result<Vec<QuarantineLogEntry>> {
        Ok(self.store.log()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use razar_state::fakes::MemoryQuarantineStore;

    fn manager() -> QuarantineManager {
        QuarantineManager::new(Arc::new(MemoryQuarantineStore::new()))
    }

    #[test]
    fn classify_dependency_logic_external() {
        assert_eq!(
            classify_issue("ModuleNotFoundError: No module named 'redis'"),
            IssueType::Dependency
        );
        assert_eq!(classify_issue("KeyError: 'port'"), IssueType::Logic);
        assert_eq!(classify_issue("connection refused"), IssueType::External);
        assert_eq!(classify_issue("HTTP 503 from gateway"), IssueType::External);
    }

    #[test]
    fn hints_cover_every_issue_type() {
        for issue in [IssueType::Dependency, IssueType::Logic, IssueType::External] {
            assert!(!remediation_hint(issue).is_empty());
        }
    }

    #[test]
    fn quarantine_is_idempotent_on_marker() {
        let qm = manager();
        qm.quarantine("db", IssueType::External, "refused", None).unwrap();
        qm.quarantine("db", IssueType::External, "refused", None).unwrap();
        assert_eq!(qm.list().unwrap().len(), 1);
        assert_eq!(qm.log().unwrap().len(), 2);
    }

    #[test]
    fn diagnostics_do_not_touch_marker() {
        let qm = manager();
        qm.quarantine("db", IssueType::Logic, "bad config", None).unwrap();
        qm.record_diagnostics("db", serde_json::json!({"trace": "..."}))
            .unwrap();
        assert!(qm.get("db").unwrap().unwrap().diagnostics.is_none());
        assert_eq!(qm.diagnostics("db").unwrap().len(), 1);
    }

    #[test]
    fn reactivation_mode_is_recorded() {
        let qm = manager();
        qm.quarantine("db", IssueType::Logic, "x", None).unwrap();
        qm.reactivate("db", true, true, Some("patched")).unwrap();
        let last = qm.log().unwrap().pop().unwrap();
        assert_eq!(last.action, QuarantineAction::Reactivated);
        assert_eq!(last.mode, Some(ReactivationMode::Auto));
        assert_eq!(last.details, "patched");
    }
}

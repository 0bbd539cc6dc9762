//! Monitoring alerts for operators.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use razar_state::JsonlLog;

use crate::domain::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One alert with structured context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default)]
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: Severity, summary: impl Into<String>) -> Self {
        Self {
            severity,
            summary: summary.into(),
            component: None,
            context: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn for_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// Destination for monitoring alerts.
pub trait AlertSink: Send + Sync {
    fn send(&self, alert: &Alert) -> Result<()>;
}

/// Appends alerts to a JSON-lines escalation log and mirrors them to tracing.
pub struct JsonlAlertSink {
    log: Arc<JsonlLog>,
}

impl JsonlAlertSink {
    pub fn new(log: Arc<JsonlLog>) -> Self {
        Self { log }
    }
}

impl AlertSink for JsonlAlertSink {
    fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical => tracing::error!(
                event = "alert",
                severity = "critical",
                component = ?alert.component,
                summary = %alert.summary,
            ),
            Severity::Warning => tracing::warn!(
                event = "alert",
                severity = "warning",
                component = ?alert.component,
                summary = %alert.summary,
            ),
            Severity::Info => tracing::info!(
                event = "alert",
                severity = "info",
                component = ?alert.component,
                summary = %alert.summary,
            ),
        }
        self.log.append(alert)?;
        Ok(())
    }
}

/// Keeps alerts in memory; handy for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn send(&self, alert: &Alert) -> Result<()> {
        self.alerts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(JsonlLog::new(dir.path().join("alerts.jsonl")));
        let sink = JsonlAlertSink::new(log.clone());
        sink.send(
            &Alert::new(Severity::Critical, "roster rolled back")
                .for_component("db")
                .with_context(serde_json::json!({"ladder_exhausted": true})),
        )
        .unwrap();
        let rows: Vec<Alert> = log.read_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].severity, Severity::Critical);
        assert_eq!(rows[0].context["ladder_exhausted"], true);
    }
}

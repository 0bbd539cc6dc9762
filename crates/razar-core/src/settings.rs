//! Runtime settings: file locations rooted at `RAZAR_HOME` plus tunables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::{EnvSource, ProcessEnv};

/// Default consecutive failures against one agent before escalating.
pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 9;
/// Default port for the Prometheus pull endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 9360;
/// Default number of mission brief pairs kept in the archive.
pub const DEFAULT_MAX_MISSION_BRIEFS: usize = 20;

/// Paths and tunables shared by every RAZAR subsystem.
#[derive(Debug, Clone)]
pub struct RazarSettings {
    /// State root
    pub home: PathBuf,
    pub roster_path: PathBuf,
    pub invocation_log: PathBuf,
    pub history_path: PathBuf,
    pub state_path: PathBuf,
    pub quarantine_dir: PathBuf,
    pub quarantine_log: PathBuf,
    pub transcript_path: PathBuf,
    pub brief_archive_dir: PathBuf,
    pub patch_log: PathBuf,
    pub patch_backup_dir: PathBuf,
    pub long_task_log: PathBuf,
    pub alert_log: PathBuf,
    pub recovery_dir: PathBuf,
    pub metrics_textfile: PathBuf,
    /// `0` disables escalation
    pub escalation_threshold: u32,
    pub metrics_port: u16,
    pub crown_url: Option<String>,
    pub crown_identity: Option<serde_json::Value>,
    /// Agent recorded in fallback events when the handshake fails
    pub fallback_agent: String,
    pub max_mission_briefs: usize,
    pub history_limit: usize,
    pub agent_timeout: Duration,
    pub handshake_timeout: Duration,
    pub test_timeout: Duration,
}

impl Default for RazarSettings {
    fn default() -> Self {
        Self::for_home(".")
    }
}

impl RazarSettings {
    /// Settings with every path under `home` and default tunables.
    pub fn for_home(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref().to_path_buf();
        let logs = home.join("logs");
        RazarSettings {
            roster_path: home.join("config").join("razar_ai_agents.json"),
            invocation_log: logs.join("razar_ai_invocations.jsonl"),
            history_path: logs.join("razar_boot_history.json"),
            state_path: logs.join("razar_state.json"),
            quarantine_dir: home.join("quarantine"),
            quarantine_log: logs.join("quarantine_log.jsonl"),
            transcript_path: logs.join("razar_crown_dialogues.jsonl"),
            brief_archive_dir: logs.join("mission_briefs"),
            patch_log: logs.join("razar_ai_patches.jsonl"),
            patch_backup_dir: logs.join("patch_backups"),
            long_task_log: logs.join("razar_long_task.jsonl"),
            alert_log: logs.join("operator_escalations.jsonl"),
            recovery_dir: logs.join("recovery"),
            metrics_textfile: logs.join("razar_boot_metrics.prom"),
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            metrics_port: DEFAULT_METRICS_PORT,
            crown_url: None,
            crown_identity: None,
            fallback_agent: "fallback".to_string(),
            max_mission_briefs: DEFAULT_MAX_MISSION_BRIEFS,
            history_limit: 50,
            agent_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(30),
            test_timeout: Duration::from_secs(90),
            home,
        }
    }

    /// Settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_source(&ProcessEnv)
    }

    /// Settings from an arbitrary environment source.
    ///
    /// Unparseable numeric values fall back to their defaults with a warning.
    pub fn from_source(env: &dyn EnvSource) -> Self {
        let home = env
            .var("RAZAR_HOME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| ".".to_string());
        let mut settings = Self::for_home(home);

        if let Some(raw) = env.var("RAZAR_ESCALATION_THRESHOLD") {
            match raw.trim().parse::<u32>() {
                Ok(v) => settings.escalation_threshold = v,
                Err(_) => tracing::warn!(value = %raw, "invalid RAZAR_ESCALATION_THRESHOLD; using default"),
            }
        }
        if let Some(raw) = env.var("RAZAR_METRICS_PORT") {
            match raw.trim().parse::<u16>() {
                Ok(v) => settings.metrics_port = v,
                Err(_) => tracing::warn!(value = %raw, "invalid RAZAR_METRICS_PORT; using default"),
            }
        }
        if let Some(path) = env.var("RAZAR_AGENT_CONFIG").filter(|v| !v.trim().is_empty()) {
            settings.roster_path = PathBuf::from(path);
        }
        if let Some(name) = env.var("RAZAR_FALLBACK_AGENT").filter(|v| !v.trim().is_empty()) {
            settings.fallback_agent = name;
        }
        settings.crown_url = env.var("CROWN_WS_URL").filter(|v| !v.trim().is_empty());
        settings.crown_identity = env
            .var("CROWN_IDENTITY_FINGERPRINT")
            .filter(|v| !v.trim().is_empty())
            .map(|raw| {
                serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
            });
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MapEnv;

    #[test]
    fn defaults_are_rooted_at_home() {
        let s = RazarSettings::for_home("/srv/razar");
        assert_eq!(
            s.invocation_log,
            PathBuf::from("/srv/razar/logs/razar_ai_invocations.jsonl")
        );
        assert_eq!(s.escalation_threshold, 9);
        assert_eq!(s.metrics_port, 9360);
    }

    #[test]
    fn env_overrides_apply() {
        let env = MapEnv::from_pairs([
            ("RAZAR_HOME", "/data"),
            ("RAZAR_ESCALATION_THRESHOLD", "2"),
            ("RAZAR_METRICS_PORT", "9999"),
            ("CROWN_WS_URL", "ws://crown:8765"),
            ("CROWN_IDENTITY_FINGERPRINT", r#"{"sha":"abc"}"#),
        ]);
        let s = RazarSettings::from_source(&env);
        assert_eq!(s.home, PathBuf::from("/data"));
        assert_eq!(s.escalation_threshold, 2);
        assert_eq!(s.metrics_port, 9999);
        assert_eq!(s.crown_url.as_deref(), Some("ws://crown:8765"));
        assert_eq!(s.crown_identity.unwrap()["sha"], "abc");
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let env = MapEnv::from_pairs([("RAZAR_ESCALATION_THRESHOLD", "often")]);
        assert_eq!(RazarSettings::from_source(&env).escalation_threshold, 9);
    }

    #[test]
    fn raw_fingerprint_kept_as_string() {
        let env = MapEnv::from_pairs([("CROWN_IDENTITY_FINGERPRINT", "deadbeef")]);
        let s = RazarSettings::from_source(&env);
        assert_eq!(s.crown_identity, Some(serde_json::json!("deadbeef")));
    }
}

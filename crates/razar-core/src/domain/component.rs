//! Component definitions and boot configuration loading.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{RazarError, Result};
use crate::probe::ProbeRegistry;

/// Declarative probe attached to a component in the boot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// GET must return 2xx.
    HttpPing { url: String },
    /// GET must return 2xx with a body containing `expect`.
    ReadySignal { url: String, expect: String },
    /// File at `path` must contain a match for `pattern`.
    LogMatch { path: String, pattern: String },
    /// Probe registered in code under `name`.
    Named { name: String },
}

/// One launchable component. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDef {
    pub name: String,
    /// argv of the long-running process
    pub command: Vec<String>,
    /// argv whose exit status decides health
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeSpec>,
    /// Test commands used to validate patches when an agent supplies none
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    /// Launch position; assigned from list order
    #[serde(skip)]
    pub priority: usize,
}

impl ComponentDef {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            health_check: None,
            probe: None,
            tests: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_health_check(mut self, argv: Vec<String>) -> Self {
        self.health_check = Some(argv);
        self
    }

    pub fn with_probe(mut self, probe: ProbeSpec) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_tests(mut self, tests: Vec<String>) -> Self {
        self.tests = tests;
        self
    }
}

/// A capability Crown must report; launched locally when missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    pub name: String,
    pub launch: Vec<String>,
}

/// Parsed boot configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BootConfig {
    pub components: Vec<ComponentDef>,
    #[serde(default)]
    pub capabilities: Vec<CapabilityRequirement>,
}

/// Load and validate the boot configuration at `path`.
pub fn load_config(path: &Path, probes: &ProbeRegistry) -> Result<BootConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        RazarError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_config(&raw, probes)
}

/// Parse and validate a boot configuration document.
///
/// Every component needs a non-empty name and command, names must be unique,
/// and each component must be checkable: a `health_check` command, a `probe`
/// spec, or a probe registered under its name.
pub fn parse_config(raw: &str, probes: &ProbeRegistry) -> Result<BootConfig> {
    let mut config: BootConfig = serde_json::from_str(raw)
        .map_err(|e| RazarError::Configuration(format!("invalid boot config: {e}")))?;

    let mut seen = HashSet::new();
    for (idx, comp) in config.components.iter_mut().enumerate() {
        if comp.name.trim().is_empty() {
            return Err(RazarError::Configuration(format!(
                "component #{idx} has an empty name"
            )));
        }
        if !seen.insert(comp.name.clone()) {
            return Err(RazarError::Configuration(format!(
                "duplicate component name: {}",
                comp.name
            )));
        }
        if comp.command.is_empty() || comp.command[0].trim().is_empty() {
            return Err(RazarError::Configuration(format!(
                "component {} has an empty command",
                comp.name
            )));
        }
        if matches!(&comp.health_check, Some(argv) if argv.is_empty()) {
            return Err(RazarError::Configuration(format!(
                "component {} has an empty health_check",
                comp.name
            )));
        }
        if let Some(ProbeSpec::Named { name }) = &comp.probe {
            if !probes.contains(name) {
                return Err(RazarError::Configuration(format!(
                    "component {} references unknown probe {name}",
                    comp.name
                )));
            }
        }
        if comp.health_check.is_none() && comp.probe.is_none() && !probes.contains(&comp.name) {
            return Err(RazarError::Configuration(format!(
                "component {} has no health_check and no registered probe",
                comp.name
            )));
        }
        comp.priority = idx;
    }

    for cap in &config.capabilities {
        if cap.launch.is_empty() {
            return Err(RazarError::Configuration(format!(
                "capability {} has an empty launch command",
                cap.name
            )));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::probe::{HealthProbe, StaticProbe};

    fn registry() -> ProbeRegistry {
        let mut reg = ProbeRegistry::new();
        reg.register("cache", Arc::new(StaticProbe::new(true)) as Arc<dyn HealthProbe>);
        reg
    }

    #[test]
    fn priorities_follow_list_order() {
        let raw = r#"{"components": [
            {"name": "db", "command": ["db-server"], "health_check": ["db-ping"]},
            {"name": "cache", "command": ["cache-server"]},
            {"name": "api", "command": ["api"], "probe": {"kind": "http_ping", "url": "http://127.0.0.1:8000/health"}}
        ]}"#;
        let cfg = parse_config(raw, &registry()).unwrap();
        let order: Vec<_> = cfg
            .components
            .iter()
            .map(|c| (c.name.as_str(), c.priority))
            .collect();
        assert_eq!(order, vec![("db", 0), ("cache", 1), ("api", 2)]);
    }

    #[test]
    fn component_without_any_probe_is_rejected() {
        let raw = r#"{"components": [{"name": "api", "command": ["api"]}]}"#;
        let err = parse_config(raw, &registry()).unwrap_err();
        assert!(matches!(err, RazarError::Configuration(msg) if msg.contains("api")));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let raw = r#"{"components": [
            {"name": "db", "command": ["a"], "health_check": ["true"]},
            {"name": "db", "command": ["b"], "health_check": ["true"]}
        ]}"#;
        assert!(parse_config(raw, &registry()).is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        let raw = r#"{"components": [{"name": "db", "command": [], "health_check": ["true"]}]}"#;
        assert!(parse_config(raw, &registry()).is_err());
    }

    #[test]
    fn unknown_named_probe_is_rejected() {
        let raw = r#"{"components": [{"name": "db", "command": ["db"], "probe": {"kind": "named", "name": "nope"}}]}"#;
        assert!(parse_config(raw, &registry()).is_err());
    }

    #[test]
    fn malformed_json_is_configuration_error() {
        let err = parse_config("{components:", &registry()).unwrap_err();
        assert!(matches!(err, RazarError::Configuration(_)));
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/definitely/missing/boot.json"), &registry()).unwrap_err();
        assert!(matches!(err, RazarError::Configuration(_)));
    }
}

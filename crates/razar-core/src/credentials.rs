//! Credential resolution for roster agents.
//!
//! Secrets live in environment variables. The roster's `credential` field
//! carries a `${VAR}` reference or a rotation placeholder. Resolution reads
//! through an [`EnvSource`] so rotation can verify against an overlay without
//! mutating the process environment.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use razar_state::{AgentEntry, AgentRoster};

use crate::domain::{RazarError, Result};

/// Read-only view of environment variables.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed map of variables.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }
}

impl EnvSource for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

/// A base source with temporary overrides layered on top.
pub struct OverlayEnv<'a> {
    base: &'a dyn EnvSource,
    overrides: HashMap<String, String>,
}

impl<'a> OverlayEnv<'a> {
    pub fn new(base: &'a dyn EnvSource) -> Self {
        Self {
            base,
            overrides: HashMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }
}

impl EnvSource for OverlayEnv<'_> {
    fn var(&self, key: &str) -> Option<String> {
        self.overrides
            .get(key)
            .cloned()
            .or_else(|| self.base.var(key))
    }
}

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable pattern is valid")
    })
}

/// Expand `${VAR}` references. Returns `None` if any reference is unset.
pub fn expand_vars(raw: &str, env: &dyn EnvSource) -> Option<String> {
    let mut missing = false;
    let expanded = var_pattern().replace_all(raw, |caps: &regex::Captures<'_>| {
        match env.var(&caps[1]) {
            Some(v) => v,
            None => {
                missing = true;
                String::new()
            }
        }
    });
    if missing {
        None
    } else {
        Some(expanded.into_owned())
    }
}

/// Upper-case an agent name into an environment-variable stem.
pub fn sanitize_env_name(name: &str) -> String {
    let mut out: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out.trim_matches('_').to_string()
}

/// Conventional variables consulted for agents with no explicit credential.
pub fn conventional_env_keys(agent: &str) -> [String; 2] {
    let stem = sanitize_env_name(agent);
    [format!("{stem}_API_KEY"), format!("{stem}_TOKEN")]
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Resolve the credential for one roster entry.
///
/// Order: the `credential_env` variable, then the `credential` field with
/// `${VAR}` expansion. Agents with neither configured fall back to the
/// conventional `<NAME>_API_KEY` / `<NAME>_TOKEN` variables and may resolve
/// to `None`. An agent that declares a credential but resolves to nothing
/// non-blank is an [`RazarError::AgentCredential`].
pub fn resolve_credential(entry: &AgentEntry, env: &dyn EnvSource) -> Result<Option<String>> {
    if let Some(var) = &entry.credential_env {
        if let Some(value) = non_blank(env.var(var)) {
            return Ok(Some(value));
        }
    }
    if let Some(raw) = &entry.credential {
        if let Some(value) = non_blank(expand_vars(raw, env)) {
            return Ok(Some(value));
        }
    }

    if !entry.requires_credential() {
        for key in conventional_env_keys(&entry.name) {
            if let Some(value) = non_blank(env.var(&key)) {
                return Ok(Some(value));
            }
        }
        return Ok(None);
    }

    let source = entry
        .credential_env
        .clone()
        .or_else(|| entry.credential.clone())
        .unwrap_or_default();
    Err(RazarError::AgentCredential {
        agent: entry.name.clone(),
        reason: format!("{source} is unset or blank"),
    })
}

/// Check every agent that declares a credential. Fails on the first gap.
pub fn validate_roster(roster: &AgentRoster, env: &dyn EnvSource) -> Result<()> {
    for entry in roster.agents.iter().filter(|a| a.requires_credential()) {
        resolve_credential(entry, env)?;
    }
    Ok(())
}

/// Every agent whose declared credential does not resolve.
pub fn missing_credentials(roster: &AgentRoster, env: &dyn EnvSource) -> Vec<RazarError> {
    roster
        .agents
        .iter()
        .filter(|a| a.requires_credential())
        .filter_map(|a| resolve_credential(a, env).err())
        .collect()
}

//! Offline credential rotation for remote agents.
//!
//! Metadata under a secrets directory names the agents to rotate. Each agent
//! gets a fresh placeholder credential in its roster, and the rotation only
//! counts once a cache-invalidated reload resolves the new value through the
//! same resolver the boot path uses.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use razar_state::{normalize_agent_name, FsRosterStore, RosterStore, StorageError};

use crate::credentials::{resolve_credential, EnvSource, OverlayEnv};
use crate::domain::RazarError;
use crate::roster::RosterCache;

pub const DEFAULT_PREFIX: &str = "ROTATE";
pub const DEFAULT_SUFFIX: &str = "TOKEN";

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("rotation directory {0} does not exist")]
    MissingDir(PathBuf),

    #[error("failed to parse rotation metadata {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    #[error("no rotation metadata discovered under {0}")]
    Empty(PathBuf),

    #[error("agent {agent} not present in {config}")]
    AgentMissing { agent: String, config: PathBuf },

    #[error("placeholder for {0} matches the existing credential")]
    Collision(String),

    #[error("agent {agent} did not reload the rotated credential: {reason}")]
    Verification { agent: String, reason: String },

    #[error(transparent)]
    Razar(#[from] RazarError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RotationError>;

/// Rotation metadata for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationSpec {
    pub name: String,
    pub env_var: Option<String>,
    pub config_path: PathBuf,
    /// Metadata file the entry came from
    pub source: PathBuf,
}

/// Outcome of rotating one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationResult {
    pub agent: String,
    pub env_var: Option<String>,
    pub placeholder: String,
    pub config_path: PathBuf,
    /// Whether the live roster was rewritten (false for dry runs)
    pub applied: bool,
}

fn parse_metadata(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref(),
        Some("yaml") | Some("yml")
    );
    let parsed: Value = if text.trim().is_empty() {
        Value::Null
    } else if is_yaml {
        serde_yaml::from_str(&text).map_err(|e| RotationError::Metadata {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    } else {
        serde_json::from_str(&text).map_err(|e| RotationError::Metadata {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };
    Ok(parsed)
}

/// Entries from `{agents: [...]}`, `{rotation: [...]}`, a bare list or a single object.
fn metadata_entries(payload: &Value) -> Vec<&serde_json::Map<String, Value>> {
    match payload {
        Value::Object(map) => {
            for key in ["agents", "rotation"] {
                if let Some(Value::Array(items)) = map.get(key) {
                    return items.iter().filter_map(Value::as_object).collect();
                }
            }
            vec![map]
        }
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

fn first_string(entry: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| entry.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn metadata_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            metadata_files(&path, out)?;
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        if matches!(ext.as_deref(), Some("json") | Some("yaml") | Some("yml")) {
            out.push(path);
        }
    }
    Ok(())
}

/// Discover rotation specs under `secrets_dir`.
///
/// Relative `config_path` overrides resolve against the metadata file's
/// directory; entries without one use `default_config`.
pub fn load_rotation_specs(
    secrets_dir: &Path,
    default_config: &Path,
) -> Result<Vec<RotationSpec>> {
    if !secrets_dir.is_dir() {
        return Err(RotationError::MissingDir(secrets_dir.to_path_buf()));
    }
    let mut files = Vec::new();
    metadata_files(secrets_dir, &mut files)?;
    files.sort();

    let mut specs = Vec::new();
    for file in files {
        let payload = parse_metadata(&file)?;
        for entry in metadata_entries(&payload) {
            let Some(name) = first_string(entry, &["name"]) else {
                tracing::debug!(file = %file.display(), "skipping rotation entry without a name");
                continue;
            };
            let env_var = first_string(entry, &["env", "env_var", "environment"]);
            let config_path = match first_string(entry, &["config_path", "config"]) {
                Some(raw) => {
                    let p = PathBuf::from(raw);
                    if p.is_absolute() {
                        p
                    } else {
                        file.parent().unwrap_or(secrets_dir).join(p)
                    }
                }
                None => default_config.to_path_buf(),
            };
            specs.push(RotationSpec {
                name,
                env_var,
                config_path,
                source: file.clone(),
            });
        }
    }
    Ok(specs)
}

fn sanitize_seed(seed: &str) -> String {
    let cleaned: String = seed
        .to_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "AGENT".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<PREFIX>_<SEED>_<12 hex of sha256(seed, previous)>_<SUFFIX>`.
///
/// Hashing the previous value makes consecutive rotations differ.
pub fn generate_placeholder(spec: &RotationSpec, previous: Option<&str>, prefix: &str, suffix: &str) -> String {
    let seed = spec.env_var.as_deref().unwrap_or(&spec.name);
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update([0u8]);
    hasher.update(previous.unwrap_or_default().as_bytes());
    let digest = hex::encode(hasher.finalize());

    [
        prefix.trim().to_uppercase(),
        sanitize_seed(seed),
        digest[..12].to_uppercase(),
        suffix.trim().to_uppercase(),
    ]
    .into_iter()
    .filter(|p| !p.is_empty())
    .collect::<Vec<_>>()
    .join("_")
}

/// Reload `store` from scratch and check `spec` resolves to `placeholder`.
fn verify_reload(
    store: Arc<dyn RosterStore>,
    spec: &RotationSpec,
    placeholder: &str,
    env: &dyn EnvSource,
) -> Result<()> {
    let cache = RosterCache::new(store);
    cache.invalidate();
    let roster = cache.load()?;
    let entry = roster
        .find(&spec.name)
        .ok_or_else(|| RotationError::Verification {
            agent: spec.name.clone(),
            reason: "missing after reload".to_string(),
        })?;
    let mut overlay = OverlayEnv::new(env);
    if let Some(var) = &spec.env_var {
        overlay = overlay.with(var.clone(), placeholder);
    }
    match resolve_credential(entry, &overlay)? {
        Some(value) if value == placeholder => Ok(()),
        other => Err(RotationError::Verification {
            agent: spec.name.clone(),
            reason: format!(
                "resolved {}",
                if other.is_some() { "a different value" } else { "nothing" }
            ),
        }),
    }
}

/// Rotate one agent. Dry runs write and verify a throwaway copy.
pub fn rotate_agent(
    spec: &RotationSpec,
    prefix: &str,
    suffix: &str,
    apply: bool,
    env: &dyn EnvSource,
) -> Result<RotationResult> {
    let live = FsRosterStore::new(&spec.config_path);
    let mut roster = live.load()?;
    let wanted = normalize_agent_name(&spec.name);
    let entry = roster
        .agents
        .iter_mut()
        .find(|a| normalize_agent_name(&a.name) == wanted)
        .ok_or_else(|| RotationError::AgentMissing {
            agent: spec.name.clone(),
            config: spec.config_path.clone(),
        })?;

    let placeholder = generate_placeholder(spec, entry.credential.as_deref(), prefix, suffix);
    if entry.credential.as_deref() == Some(placeholder.as_str()) {
        return Err(RotationError::Collision(spec.name.clone()));
    }
    entry.credential = Some(placeholder.clone());
    if let Some(var) = &spec.env_var {
        entry.credential_env = Some(var.clone());
    }

    if apply {
        let store: Arc<dyn RosterStore> = Arc::new(live);
        RosterCache::new(store.clone()).save(&roster)?;
        verify_reload(store, spec, &placeholder, env)?;
    } else {
        let scratch = tempfile::Builder::new()
            .prefix("razar_rotation_")
            .suffix(".json")
            .tempfile()?;
        let store: Arc<dyn RosterStore> = Arc::new(FsRosterStore::new(scratch.path()));
        store.save(&roster)?;
        verify_reload(store, spec, &placeholder, env)?;
    }

    tracing::info!(
        agent = %spec.name,
        env = ?spec.env_var,
        applied = apply,
        config = %spec.config_path.display(),
        "credential rotated"
    );
    Ok(RotationResult {
        agent: spec.name.clone(),
        env_var: spec.env_var.clone(),
        placeholder,
        config_path: spec.config_path.clone(),
        applied: apply,
    })
}

/// Rotate every agent named under `secrets_dir`.
pub fn rotate_keys(
    secrets_dir: &Path,
    default_config: &Path,
    prefix: &str,
    suffix: &str,
    apply: bool,
    env: &dyn EnvSource,
) -> Result<Vec<RotationResult>> {
    let specs = load_rotation_specs(secrets_dir, default_config)?;
    if specs.is_empty() {
        return Err(RotationError::Empty(secrets_dir.to_path_buf()));
    }
    specs
        .iter()
        .map(|spec| rotate_agent(spec, prefix, suffix, apply, env))
        .collect()
}

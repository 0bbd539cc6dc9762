//! Health probe registry.
//!
//! A probe answers one question: is this component healthy right now?
//! Probes are looked up per component in this order: the `health_check`
//! command, the declarative `probe` spec, then a probe registered under the
//! component's name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::domain::{ComponentDef, ProbeSpec, RazarError, Result};

/// Default timeout for one probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A pass/fail health check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Short description used in logs.
    fn describe(&self) -> String;

    /// Run the check. Errors and timeouts count as unhealthy.
    async fn probe(&self) -> bool;
}

/// Runs a command; exit status zero means healthy.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    fn describe(&self) -> String {
        format!("command `{}`", self.argv.join(" "))
    }

    async fn probe(&self) -> bool {
        let Some((program, args)) = self.argv.split_first() else {
            return false;
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(self.timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, probe = %self.describe(), "probe command failed to start");
                false
            }
            Err(_) => false,
        }
    }
}

/// GET must return a 2xx status.
#[derive(Debug, Clone)]
pub struct HttpPingProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpPingProbe {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpPingProbe {
    fn describe(&self) -> String {
        format!("http ping {}", self.url)
    }

    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// GET must return 2xx with a body containing a ready marker.
#[derive(Debug, Clone)]
pub struct ReadySignalProbe {
    url: String,
    expect: String,
    client: reqwest::Client,
}

impl ReadySignalProbe {
    pub fn new(url: impl Into<String>, expect: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            expect: expect.into(),
            client,
        }
    }
}

#[async_trait]
impl HealthProbe for ReadySignalProbe {
    fn describe(&self) -> String {
        format!("ready signal {} ({})", self.url, self.expect)
    }

    async fn probe(&self) -> bool {
        let resp = match self.client.get(&self.url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return false,
        };
        match resp.text().await {
            Ok(body) => body.contains(&self.expect),
            Err(_) => false,
        }
    }
}

/// File must contain a line matching a pattern.
#[derive(Debug, Clone)]
pub struct LogMatchProbe {
    path: PathBuf,
    pattern: Regex,
}

impl LogMatchProbe {
    pub fn new(path: impl Into<PathBuf>, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| RazarError::Configuration(format!("invalid log pattern {pattern}: {e}")))?;
        Ok(Self {
            path: path.into(),
            pattern,
        })
    }
}

#[async_trait]
impl HealthProbe for LogMatchProbe {
    fn describe(&self) -> String {
        format!("log match {} /{}/", self.path.display(), self.pattern)
    }

    async fn probe(&self) -> bool {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => self.pattern.is_match(&text),
            Err(_) => false,
        }
    }
}

/// Always returns a fixed answer. Useful for components without a real check.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    healthy: bool,
}

impl StaticProbe {
    pub fn new(healthy: bool) -> Self {
        Self { healthy }
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    fn describe(&self) -> String {
        format!("static {}", self.healthy)
    }

    async fn probe(&self) -> bool {
        self.healthy
    }
}

/// Named probes plus the shared HTTP client used to build declarative ones.
#[derive(Clone)]
pub struct ProbeRegistry {
    named: HashMap<String, Arc<dyn HealthProbe>>,
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("razar/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            named: HashMap::new(),
            client,
            timeout,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        self.named.insert(name.into(), probe);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HealthProbe>> {
        self.named.get(name).cloned()
    }

    /// Build a probe from a declarative spec.
    pub fn build(&self, spec: &ProbeSpec) -> Result<Arc<dyn HealthProbe>> {
        Ok(match spec {
            ProbeSpec::HttpPing { url } => Arc::new(HttpPingProbe::new(url, self.client.clone())),
            ProbeSpec::ReadySignal { url, expect } => {
                Arc::new(ReadySignalProbe::new(url, expect, self.client.clone()))
            }
            ProbeSpec::LogMatch { path, pattern } => Arc::new(LogMatchProbe::new(path, pattern)?),
            ProbeSpec::Named { name } => self.get(name).ok_or_else(|| {
                RazarError::Configuration(format!("unknown probe {name}"))
            })?,
        })
    }

    /// The probe for a component, or `None` when it has no check at all.
    pub fn resolve(&self, def: &ComponentDef) -> Result<Option<Arc<dyn HealthProbe>>> {
        if let Some(argv) = &def.health_check {
            return Ok(Some(Arc::new(
                CommandProbe::new(argv.clone()).with_timeout(self.timeout),
            )));
        }
        if let Some(spec) = &def.probe {
            return self.build(spec).map(Some);
        }
        Ok(self.get(&def.name))
    }
}

//! Remediation agent contract and the HTTP implementation.
//!
//! An agent receives an [`EscalationContext`] and answers with zero or more
//! [`PatchSuggestion`]s. How it derives them is its own business.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use razar_state::{AgentEntry, InvocationEvent};

use crate::domain::{RazarError, Result};

/// Failure context handed to an agent. Rebuilt before every handover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationContext {
    pub component: String,
    pub error: String,
    /// Prior invocation events for the component, oldest first
    pub history: Vec<InvocationEvent>,
}

/// One proposed replacement for a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSuggestion {
    /// Path relative to the project root
    pub module: String,
    /// Full replacement content
    #[serde(default)]
    pub content: Option<String>,
    /// Commands that must pass for the patch to be kept
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PatchSuggestion {
    pub fn replace(module: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            content: Some(content.into()),
            tests: Vec::new(),
            diff: None,
            error: None,
        }
    }

    pub fn with_tests(mut self, tests: Vec<String>) -> Self {
        self.tests = tests;
        self
    }
}

fn modules_from_diff(diff: &str) -> Vec<String> {
    diff.lines()
        .filter_map(|l| l.strip_prefix("+++ "))
        .map(|p| p.trim())
        .map(|p| p.strip_prefix("b/").unwrap_or(p))
        .filter(|p| *p != "/dev/null" && !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

fn parse_one(value: &Value, out: &mut Vec<PatchSuggestion>) {
    let Value::Object(map) = value else {
        tracing::warn!(payload = %value, "ignoring non-object suggestion");
        return;
    };
    if map.contains_key("module") {
        match serde_json::from_value::<PatchSuggestion>(value.clone()) {
            Ok(s) => out.push(s),
            Err(e) => tracing::warn!(error = %e, "ignoring malformed suggestion"),
        }
        return;
    }
    if let Some(Value::String(diff)) = map.get("diff") {
        for module in modules_from_diff(diff) {
            out.push(PatchSuggestion {
                module,
                content: None,
                tests: Vec::new(),
                diff: Some(diff.clone()),
                error: None,
            });
        }
    }
}

/// Normalize an agent response into suggestions.
///
/// Accepts a single object, a list, or an object wrapping a `suggestions`
/// or `patches` list. Objects carrying only a `diff` yield one suggestion per
/// `+++ b/<path>` header.
pub fn parse_suggestions(value: &Value) -> Vec<PatchSuggestion> {
    let mut out = Vec::new();
    match value {
        Value::Null => {}
        Value::Array(items) => items.iter().for_each(|v| parse_one(v, &mut out)),
        Value::Object(map) => {
            let wrapped = map
                .get("suggestions")
                .or_else(|| map.get("patches"))
                .and_then(Value::as_array);
            match wrapped {
                Some(items) => items.iter().for_each(|v| parse_one(v, &mut out)),
                None => parse_one(value, &mut out),
            }
        }
        other => tracing::warn!(payload = %other, "ignoring unexpected agent response"),
    }
    out
}

/// A remediation agent.
#[async_trait]
pub trait RemediationAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, ctx: &EscalationContext) -> Result<Vec<PatchSuggestion>>;
}

/// Builds agents from roster entries and resolved credentials.
pub trait AgentFactory: Send + Sync {
    fn build(&self, entry: &AgentEntry, credential: Option<String>) -> Result<Arc<dyn RemediationAgent>>;
}

/// JSON-over-HTTP agent.
#[derive(Debug, Clone)]
pub struct HttpAgent {
    name: String,
    endpoint: String,
    credential: Option<String>,
    client: reqwest::Client,
}

impl HttpAgent {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        credential: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            credential,
            client,
        }
    }

    fn request_error(&self, reason: impl Into<String>) -> RazarError {
        RazarError::AgentRequest {
            agent: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl RemediationAgent for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &EscalationContext) -> Result<Vec<PatchSuggestion>> {
        let mut req = self.client.post(&self.endpoint).json(ctx);
        if let Some(token) = &self.credential {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| self.request_error(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.request_error(format!("HTTP {status}")));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| self.request_error(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| self.request_error(format!("invalid JSON response: {e}")))?;
        Ok(parse_suggestions(&value))
    }
}

/// Builds [`HttpAgent`]s sharing one client with a fixed timeout.
#[derive(Debug, Clone)]
pub struct HttpAgentFactory {
    client: reqwest::Client,
}

impl HttpAgentFactory {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("razar/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| RazarError::Configuration(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

impl AgentFactory for HttpAgentFactory {
    fn build(&self, entry: &AgentEntry, credential: Option<String>) -> Result<Arc<dyn RemediationAgent>> {
        let endpoint = entry.endpoint.clone().ok_or_else(|| {
            RazarError::Configuration(format!("agent {} has no endpoint", entry.name))
        })?;
        Ok(Arc::new(HttpAgent::new(
            entry.name.clone(),
            endpoint,
            credential,
            self.client.clone(),
        )))
    }
}

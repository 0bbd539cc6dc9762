//! AI invoker: handover to the active remediation agent, apply its patches,
//! and walk the escalation ladder.
//!
//! Every attempt rebuilds the escalation context from the invocation log, so
//! the n-th handover sees exactly the events recorded before it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use razar_state::{AgentEntry, InvocationEvent, InvocationKind, InvocationLog};
use tracing::instrument;

use crate::agent::{AgentFactory, EscalationContext};
use crate::credentials::{resolve_credential, EnvSource};
use crate::domain::{ComponentDef, RazarError, Result};
use crate::launch::ComponentRunner;
use crate::metrics::RazarMetrics;
use crate::obs;
use crate::patch::{PatchApplier, PatchOutcome};
use crate::process::ProcessHandle;
use crate::roster::RosterCache;
use crate::settings::DEFAULT_ESCALATION_THRESHOLD;

/// `min(base * 2^(attempt-1), cap)`.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

/// Tunables for the invoker.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokerConfig {
    /// Consecutive failures before escalating; `0` disables escalation
    pub escalation_threshold: u32,
    /// Keep only the newest N events in the context; `None` keeps all
    pub context_limit: Option<usize>,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            context_limit: None,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Consecutive failed handovers per component. Reset by an applied patch.
#[derive(Debug, Default, Clone)]
pub struct FailureTracker {
    counts: HashMap<String, u32>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, component: &str) -> u32 {
        let count = self.counts.entry(component.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, component: &str) {
        self.counts.remove(component);
    }

    pub fn count(&self, component: &str) -> u32 {
        self.counts.get(component).copied().unwrap_or(0)
    }
}

/// What one handover attempt produced.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub agent: String,
    pub patched: bool,
    pub outcomes: Vec<PatchOutcome>,
    /// Handover failure, if the agent could not be used
    pub error: Option<String>,
}

/// Result of [`AiInvoker::retry_with_ai`].
pub struct RetryOutcome {
    /// Live handle when a patch led to a healthy relaunch
    pub handle: Option<Box<dyn ProcessHandle>>,
    pub attempts_used: u32,
    pub last_error: String,
}

impl std::fmt::Debug for RetryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOutcome")
            .field("recovered", &self.handle.is_some())
            .field("attempts_used", &self.attempts_used)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Drives handovers against the roster's active agent.
pub struct AiInvoker {
    events: Arc<dyn InvocationLog>,
    roster: Arc<RosterCache>,
    env: Arc<dyn EnvSource>,
    agents: Arc<dyn AgentFactory>,
    patcher: PatchApplier,
    metrics: Arc<RazarMetrics>,
    config: InvokerConfig,
}

impl AiInvoker {
    pub fn new(
        events: Arc<dyn InvocationLog>,
        roster: Arc<RosterCache>,
        env: Arc<dyn EnvSource>,
        agents: Arc<dyn AgentFactory>,
        patcher: PatchApplier,
        metrics: Arc<RazarMetrics>,
        config: InvokerConfig,
    ) -> Self {
        Self {
            events,
            roster,
            env,
            agents,
            patcher,
            metrics,
            config,
        }
    }

    pub fn roster(&self) -> &Arc<RosterCache> {
        &self.roster
    }

    pub fn events(&self) -> &Arc<dyn InvocationLog> {
        &self.events
    }

    pub fn env(&self) -> &Arc<dyn EnvSource> {
        &self.env
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Context for the next handover: the component's prior events in order.
    pub fn build_context(&self, component: &str, error: &str) -> Result<EscalationContext> {
        let mut history = self.events.events_for(component)?;
        if let Some(limit) = self.config.context_limit {
            if history.len() > limit {
                history.drain(..history.len() - limit);
            }
        }
        Ok(EscalationContext {
            component: component.to_string(),
            error: error.to_string(),
            history,
        })
    }

    /// Send `context` to `entry` and apply whatever it suggests.
    ///
    /// Fails fast with [`RazarError::AgentCredential`] before any network
    /// call when the agent's credential does not resolve.
    pub async fn handover(
        &self,
        def: &ComponentDef,
        attempt: u32,
        context: &EscalationContext,
        entry: &AgentEntry,
    ) -> Result<Vec<PatchOutcome>> {
        let credential = resolve_credential(entry, self.env.as_ref())?;
        let agent = self.agents.build(entry, credential)?;
        let suggestions = agent.invoke(context).await?;
        if suggestions.is_empty() {
            tracing::info!(component = %def.name, agent = %entry.name, "agent returned no suggestions");
        }
        let mut outcomes = Vec::with_capacity(suggestions.len());
        for suggestion in &suggestions {
            outcomes.push(
                self.patcher
                    .apply(&def.name, attempt, suggestion, &def.tests)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    /// One handover against the active agent, with logging, metrics and
    /// ladder bookkeeping.
    ///
    /// Handover errors never escape: they become a failed attempt. `Err` only
    /// means the attempt itself could not be recorded.
    #[instrument(skip(self, def, error, tracker), fields(component = %def.name))]
    pub async fn attempt(
        &self,
        def: &ComponentDef,
        error: &str,
        attempt: u32,
        tracker: &mut FailureTracker,
    ) -> Result<AttemptReport> {
        let entry = self.roster.active()?;
        let context = self.build_context(&def.name, error)?;

        let started = Instant::now();
        let result = self.handover(def, attempt, &context, &entry).await;
        self.metrics.observe_agent_latency(&entry.name, started.elapsed());
        self.metrics.inc_retry(&def.name);

        // Any handover error is a failed attempt; it is logged below before
        // the ladder moves.
        let (outcomes, failure, unusable_agent) = match result {
            Ok(outcomes) => (outcomes, None, false),
            Err(e @ (RazarError::AgentCredential { .. } | RazarError::Configuration(_))) => {
                tracing::warn!(agent = %entry.name, error = %e, "agent unusable; escalating");
                (Vec::new(), Some(e.to_string()), true)
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(agent = %entry.name, error = %e, "handover failed");
                (Vec::new(), Some(e.to_string()), false)
            }
            Err(e) => {
                tracing::error!(agent = %entry.name, error = %e, "handover errored");
                (Vec::new(), Some(e.to_string()), false)
            }
        };
        let patched = outcomes.iter().any(|o| o.applied);

        self.events.append(
            InvocationEvent::new(&def.name, InvocationKind::Attempt)
                .with_agent(&entry.name)
                .with_error(failure.clone().unwrap_or_else(|| error.to_string()))
                .with_attempt(attempt)
                .with_patched(patched),
        )?;
        self.metrics.record_invocation(&def.name, patched);
        obs::emit_agent_attempt(&def.name, &entry.name, attempt, patched);

        self.handle_result(&def.name, error, attempt, patched, unusable_agent, tracker)?;

        Ok(AttemptReport {
            agent: entry.name,
            patched,
            outcomes,
            error: failure,
        })
    }

    /// Reset on success; otherwise count the failure and escalate when the
    /// count reaches a multiple of the threshold or the agent is unusable.
    fn handle_result(
        &self,
        component: &str,
        error: &str,
        attempt: u32,
        patched: bool,
        force: bool,
        tracker: &mut FailureTracker,
    ) -> Result<()> {
        if patched {
            tracker.reset(component);
            return Ok(());
        }
        let count = tracker.increment(component);
        let threshold = self.config.escalation_threshold;
        let due = threshold > 0 && count % threshold == 0;
        if !(force || due) {
            return Ok(());
        }
        match self.roster.advance()? {
            Some(step) => {
                self.events.append(
                    InvocationEvent::new(component, InvocationKind::Escalation)
                        .with_agent(&step.to.name)
                        .with_error(error)
                        .with_attempt(attempt),
                )?;
                obs::emit_escalation(component, &step.from.name, &step.to.name);
            }
            None => {
                tracing::warn!(component = %component, "escalation ladder exhausted");
            }
        }
        Ok(())
    }

    /// Bounded remediation loop for a component that failed its local retries.
    ///
    /// Returns the live handle as soon as a patch leads to a healthy relaunch,
    /// or `(None, max_attempts, last_error)` once attempts run out.
    pub async fn retry_with_ai(
        &self,
        def: &ComponentDef,
        error: &str,
        max_attempts: u32,
        tracker: &mut FailureTracker,
        runner: &ComponentRunner,
    ) -> Result<RetryOutcome> {
        let started = Instant::now();
        let mut last_error = error.to_string();
        let mut agent = String::new();

        for attempt in 1..=max_attempts {
            let report = self.attempt(def, &last_error, attempt, tracker).await?;
            agent = report.agent;
            if report.patched {
                match runner.launch_component(def).await {
                    Ok(handle) => {
                        self.metrics
                            .observe_retry_duration(&def.name, &agent, started.elapsed());
                        return Ok(RetryOutcome {
                            handle: Some(handle),
                            attempts_used: attempt,
                            last_error,
                        });
                    }
                    Err(e) => last_error = e.to_string(),
                }
            }
            if attempt < max_attempts {
                let delay =
                    backoff_delay(self.config.backoff_base, attempt, self.config.backoff_cap);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.metrics
            .observe_retry_duration(&def.name, &agent, started.elapsed());
        Ok(RetryOutcome {
            handle: None,
            attempts_used: max_attempts,
            last_error,
        })
    }
}

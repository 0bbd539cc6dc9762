//! Boot orchestrator: sequential launch with local retries, AI remediation
//! and fail-fast rollback.
//!
//! One control task drives components in priority order. A component that
//! cannot be recovered is quarantined, the agent roster is restored from its
//! pre-run backup, every started process is terminated and the run aborts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::Instrument;

use razar_state::{
    BootLogEntry, BootState, ComponentRun, FsHistoryStore, FsInvocationLog, FsQuarantineStore,
    FsRosterStore, HistoryStore, InvocationEvent, InvocationKind, IssueType, JsonDocument,
    JsonlLog, LongTaskEntry, RunMetrics, StorageError,
};

use crate::agent::HttpAgentFactory;
use crate::alert::{Alert, AlertSink, JsonlAlertSink, Severity};
use crate::credentials::{missing_credentials, EnvSource, ProcessEnv};
use crate::crown::{
    has_capability, CrownHandshake, CrownResponse, HandshakeError, MissionBrief, WsCrownTransport,
};
use crate::domain::{
    BootConfig, ComponentDef, ComponentLifecycle, ComponentState, RazarError, Result,
};
use crate::history::{finalize_metrics, summarize_run};
use crate::invoker::{backoff_delay, AiInvoker, FailureTracker, InvokerConfig};
use crate::launch::ComponentRunner;
use crate::metrics::RazarMetrics;
use crate::obs;
use crate::patch::{CommandTestRunner, PatchApplier};
use crate::probe::ProbeRegistry;
use crate::process::{run_to_completion, ProcessHandle, TokioLauncher};
use crate::quarantine::{classify_issue, remediation_hint, QuarantineManager};
use crate::recovery::RecoveryManager;
use crate::roster::RosterCache;
use crate::settings::RazarSettings;

/// Knobs for one boot run.
#[derive(Debug, Clone, PartialEq)]
pub struct BootOptions {
    /// Local relaunches after the first failed launch
    pub retries: u32,
    /// Bounded remediation attempts after local retries are exhausted
    pub remote_attempts: u32,
    /// Quarantine without launching once cumulative failures reach this; `0` disables
    pub failure_limit: u32,
    /// Remediate until success or operator abort instead of `remote_attempts`
    pub long_task: bool,
    pub handshake: bool,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            remote_attempts: 3,
            failure_limit: 3,
            long_task: false,
            handshake: true,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootOutcome {
    Completed,
    Aborted { component: String, reason: String },
}

/// Result of [`BootOrchestrator::boot`].
pub struct BootReport {
    pub run_id: String,
    pub run: RunMetrics,
    pub outcome: BootOutcome,
    /// Live processes; empty when the run aborted
    pub handles: Vec<Box<dyn ProcessHandle>>,
    /// Components skipped or quarantined during this run
    pub quarantined: Vec<String>,
    pub handshake: Option<CrownResponse>,
}

impl BootReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == BootOutcome::Completed
    }

    /// Terminate every live process.
    pub async fn shutdown(&mut self) {
        terminate_all(&mut self.handles).await;
    }
}

async fn terminate_all(handles: &mut Vec<Box<dyn ProcessHandle>>) {
    for mut handle in handles.drain(..).rev() {
        if let Err(e) = handle.terminate().await {
            tracing::warn!(component = %handle.component(), error = %e, "terminate failed");
        }
    }
}

/// Resolves once `rx` reads `true`; never resolves if the sender is gone.
async fn abort_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

enum ComponentStep {
    /// Quarantined already or by the failure limit
    Skipped,
    Started {
        handle: Box<dyn ProcessHandle>,
        attempts: u32,
    },
    Failed {
        attempts: u32,
        error: String,
    },
    Interrupted {
        attempts: u32,
    },
}

enum Remediation {
    Recovered {
        handle: Box<dyn ProcessHandle>,
        attempts: u32,
    },
    Exhausted {
        attempts: u32,
        error: String,
    },
    Interrupted {
        attempts: u32,
    },
}

/// Collaborators the orchestrator drives.
pub struct BootDeps {
    pub settings: RazarSettings,
    pub runner: ComponentRunner,
    pub invoker: AiInvoker,
    pub quarantine: QuarantineManager,
    /// `None` records a handshake failure without dialing out
    pub crown: Option<CrownHandshake>,
    pub alerts: Arc<dyn AlertSink>,
    pub history: Arc<dyn HistoryStore>,
    pub metrics: Arc<RazarMetrics>,
}

pub struct BootOrchestrator {
    settings: RazarSettings,
    runner: ComponentRunner,
    invoker: AiInvoker,
    quarantine: QuarantineManager,
    crown: Option<CrownHandshake>,
    alerts: Arc<dyn AlertSink>,
    history: Arc<dyn HistoryStore>,
    metrics: Arc<RazarMetrics>,
    long_task_log: JsonlLog,
    state: JsonDocument<BootState>,
    options: BootOptions,
    abort: watch::Receiver<bool>,
}

impl BootOrchestrator {
    pub fn new(deps: BootDeps, options: BootOptions, abort: watch::Receiver<bool>) -> Self {
        let long_task_log = JsonlLog::new(&deps.settings.long_task_log);
        let state = JsonDocument::new(&deps.settings.state_path);
        Self {
            settings: deps.settings,
            runner: deps.runner,
            invoker: deps.invoker,
            quarantine: deps.quarantine,
            crown: deps.crown,
            alerts: deps.alerts,
            history: deps.history,
            metrics: deps.metrics,
            long_task_log,
            state,
            options,
            abort,
        }
    }

    /// Filesystem-backed orchestrator rooted at `settings.home`.
    pub fn from_settings(
        settings: RazarSettings,
        options: BootOptions,
        probes: ProbeRegistry,
        metrics: Arc<RazarMetrics>,
        abort: watch::Receiver<bool>,
    ) -> Result<Self> {
        let env: Arc<dyn EnvSource> = Arc::new(ProcessEnv);
        let quarantine = QuarantineManager::new(Arc::new(FsQuarantineStore::new(
            &settings.quarantine_dir,
            &settings.quarantine_log,
        )));
        let patcher = PatchApplier::new(
            &settings.home,
            &settings.patch_backup_dir,
            Arc::new(JsonlLog::new(&settings.patch_log)),
            Arc::new(CommandTestRunner::new(settings.test_timeout)),
            quarantine.clone(),
        );
        let invoker = AiInvoker::new(
            Arc::new(FsInvocationLog::new(&settings.invocation_log)),
            Arc::new(RosterCache::new(Arc::new(FsRosterStore::new(
                &settings.roster_path,
            )))),
            env,
            Arc::new(HttpAgentFactory::new(settings.agent_timeout)?),
            patcher,
            metrics.clone(),
            InvokerConfig {
                escalation_threshold: settings.escalation_threshold,
                backoff_base: options.backoff_base,
                backoff_cap: options.max_backoff,
                ..InvokerConfig::default()
            },
        );
        let crown = match WsCrownTransport::from_url(
            settings.crown_url.as_deref(),
            settings.handshake_timeout,
        ) {
            Ok(transport) => Some(
                CrownHandshake::new(
                    Arc::new(transport),
                    Arc::new(JsonlLog::new(&settings.transcript_path)),
                    &settings.brief_archive_dir,
                    RecoveryManager::new(&settings.recovery_dir),
                )
                .with_identity(settings.crown_identity.clone())
                .with_max_briefs(settings.max_mission_briefs),
            ),
            Err(_) => None,
        };
        let deps = BootDeps {
            runner: ComponentRunner::new(Arc::new(TokioLauncher::new()), probes),
            invoker,
            quarantine,
            crown,
            alerts: Arc::new(JsonlAlertSink::new(Arc::new(JsonlLog::new(
                &settings.alert_log,
            )))),
            history: Arc::new(FsHistoryStore::new(&settings.history_path)),
            metrics,
            settings,
        };
        Ok(Self::new(deps, options, abort))
    }

    pub fn settings(&self) -> &RazarSettings {
        &self.settings
    }

    pub fn invoker(&self) -> &AiInvoker {
        &self.invoker
    }

    pub fn quarantine(&self) -> &QuarantineManager {
        &self.quarantine
    }

    fn log_step(
        &self,
        step: &str,
        status: &str,
        component: Option<&str>,
        detail: Option<String>,
    ) -> Result<()> {
        self.state.update(|s| {
            s.events.push(BootLogEntry {
                timestamp: Utc::now(),
                step: step.to_string(),
                status: status.to_string(),
                component: component.map(str::to_string),
                detail,
            })
        })?;
        Ok(())
    }

    /// Run the boot sequence for `config`.
    pub async fn boot(&self, config: &BootConfig) -> Result<BootReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = obs::boot_span(&run_id);
        self.run(config, run_id).instrument(span).await
    }

    async fn run(&self, config: &BootConfig, run_id: String) -> Result<BootReport> {
        let started = Instant::now();
        obs::emit_boot_started(&run_id, config.components.len());
        self.log_step("boot_sequence", "start", None, None)?;

        match self.invoker.roster().store().snapshot_backup() {
            Ok(()) => {}
            Err(StorageError::NotFound { what }) => {
                tracing::warn!(%what, "no roster to back up; rollback disabled for this run");
            }
            Err(e) => return Err(e.into()),
        }
        self.preflight_credentials();

        let handshake = if self.options.handshake {
            self.handshake(config).await?
        } else {
            None
        };

        let mut failure_counts = self.history.load()?.component_failures;
        let mut tracker = FailureTracker::new();
        let mut handles: Vec<Box<dyn ProcessHandle>> = Vec::new();
        let mut rows: Vec<ComponentRun> = Vec::new();
        let mut quarantined: Vec<String> = Vec::new();
        let mut outcome = BootOutcome::Completed;

        let mut ordered: Vec<&ComponentDef> = config.components.iter().collect();
        ordered.sort_by_key(|d| d.priority);

        for def in ordered {
            let step = match self
                .boot_component(def, &failure_counts, &mut tracker)
                .await
            {
                Ok(step) => step,
                Err(e) => return Err(self.abort_on_error(def, e, &mut handles).await),
            };
            match step {
                ComponentStep::Skipped => quarantined.push(def.name.clone()),
                ComponentStep::Started { handle, attempts } => {
                    handles.push(handle);
                    rows.push(ComponentRun {
                        name: def.name.clone(),
                        attempts,
                        success: true,
                    });
                }
                ComponentStep::Failed { attempts, error } => {
                    *failure_counts.entry(def.name.clone()).or_insert(0) += 1;
                    rows.push(ComponentRun {
                        name: def.name.clone(),
                        attempts,
                        success: false,
                    });
                    if let Err(e) = self.fail_fast(def, &error, attempts) {
                        terminate_all(&mut handles).await;
                        return Err(e);
                    }
                    quarantined.push(def.name.clone());
                    outcome = BootOutcome::Aborted {
                        component: def.name.clone(),
                        reason: error,
                    };
                    break;
                }
                ComponentStep::Interrupted { attempts } => {
                    tracing::warn!(component = %def.name, "operator aborted long task");
                    rows.push(ComponentRun {
                        name: def.name.clone(),
                        attempts,
                        success: false,
                    });
                    outcome = BootOutcome::Aborted {
                        component: def.name.clone(),
                        reason: "operator abort".to_string(),
                    };
                    break;
                }
            }
        }

        if outcome != BootOutcome::Completed {
            terminate_all(&mut handles).await;
        }

        let run = summarize_run(rows, started.elapsed().as_secs_f64());
        finalize_metrics(
            self.history.as_ref(),
            &run,
            &failure_counts,
            self.settings.history_limit,
        )?;
        self.metrics.record_run(&run);
        if let Err(e) = self.metrics.write_textfile(&self.settings.metrics_textfile) {
            tracing::warn!(error = %e, "could not write metrics textfile");
        }

        let status = match &outcome {
            BootOutcome::Completed => "complete",
            BootOutcome::Aborted { .. } => "fail",
        };
        self.log_step(
            "boot_sequence",
            status,
            None,
            Some(format!("success_rate={:.3}", run.success_rate)),
        )?;
        obs::emit_boot_finished(
            &run_id,
            outcome == BootOutcome::Completed,
            started.elapsed().as_millis() as u64,
            quarantined.len(),
        );

        Ok(BootReport {
            run_id,
            run,
            outcome,
            handles,
            quarantined,
            handshake,
        })
    }

    /// Launch one component, remediating if its local retries fail.
    async fn boot_component(
        &self,
        def: &ComponentDef,
        failure_counts: &BTreeMap<String, u32>,
        tracker: &mut FailureTracker,
    ) -> Result<ComponentStep> {
        if self.quarantine.is_quarantined(&def.name)? {
            tracing::info!(component = %def.name, "skipping quarantined component");
            return Ok(ComponentStep::Skipped);
        }
        let mut lifecycle = ComponentLifecycle::new(&def.name);

        let prior = failure_counts.get(&def.name).copied().unwrap_or(0);
        if self.options.failure_limit > 0 && prior >= self.options.failure_limit {
            tracing::warn!(component = %def.name, failures = prior, "failure limit reached; quarantining");
            lifecycle.transition(ComponentState::Quarantined)?;
            self.quarantine.quarantine(
                &def.name,
                IssueType::External,
                "exceeded cumulative failure limit",
                Some(json!({ "failures": prior, "limit": self.options.failure_limit })),
            )?;
            return Ok(ComponentStep::Skipped);
        }

        let (launched, local_attempts) = self.launch_with_retries(def, &mut lifecycle).await?;
        let error = match launched {
            Ok(handle) => {
                return Ok(ComponentStep::Started {
                    handle,
                    attempts: local_attempts,
                })
            }
            Err(error) => error,
        };

        lifecycle.transition(ComponentState::Escalating)?;
        let remediation = if self.options.long_task {
            self.long_task(def, &error, tracker).await?
        } else {
            self.bounded_remediation(def, &error, tracker).await?
        };

        Ok(match remediation {
            Remediation::Recovered { handle, attempts } => {
                lifecycle.transition(ComponentState::Healthy)?;
                ComponentStep::Started {
                    handle,
                    attempts: local_attempts + attempts,
                }
            }
            Remediation::Exhausted { attempts, error } => {
                lifecycle.transition(ComponentState::Quarantined)?;
                ComponentStep::Failed {
                    attempts: local_attempts + attempts,
                    error,
                }
            }
            Remediation::Interrupted { attempts } => ComponentStep::Interrupted {
                attempts: local_attempts + attempts,
            },
        })
    }

    /// An error escaped while `def` was booting: quarantine it, roll the
    /// roster back and stop every started process before reporting it.
    async fn abort_on_error(
        &self,
        def: &ComponentDef,
        error: RazarError,
        handles: &mut Vec<Box<dyn ProcessHandle>>,
    ) -> RazarError {
        tracing::error!(component = %def.name, error = %error, "boot step errored; rolling back");
        if let Err(e) = self.fail_fast(def, &error.to_string(), 0) {
            tracing::error!(component = %def.name, error = %e, "rollback after error failed");
        }
        terminate_all(handles).await;
        error
    }

    fn preflight_credentials(&self) {
        match self.invoker.roster().load() {
            Ok(roster) => {
                for problem in missing_credentials(&roster, self.invoker.env().as_ref()) {
                    tracing::warn!(error = %problem, "agent credential unavailable");
                }
            }
            Err(e) => tracing::warn!(error = %e, "agent roster unavailable"),
        }
    }

    /// Exchange the mission brief. Failure is recorded as a handshake/fallback
    /// pair for every component and never aborts the run.
    async fn handshake(&self, config: &BootConfig) -> Result<Option<CrownResponse>> {
        self.log_step("handshake", "start", None, None)?;
        let quarantined: Vec<String> = self
            .quarantine
            .list()?
            .into_iter()
            .map(|r| r.component)
            .collect();
        let brief = MissionBrief::for_config(config, &quarantined);

        let result = match &self.crown {
            Some(crown) => crown.perform(&brief).await,
            None => Err(HandshakeError::MissingUrl),
        };

        match result {
            Ok(response) => {
                self.log_step(
                    "handshake",
                    "success",
                    None,
                    Some(response.capabilities.join(",")),
                )?;
                let capabilities = response.capabilities.clone();
                let downtime = serde_json::Value::Object(response.downtime.clone());
                self.state.update(|s| {
                    s.capabilities = capabilities;
                    s.downtime = downtime;
                    s.last_handshake = Some(Utc::now());
                })?;
                for def in &config.components {
                    self.invoker.events().append(
                        InvocationEvent::new(&def.name, InvocationKind::Handshake)
                            .with_agent("crown"),
                    )?;
                }
                self.ensure_capabilities(config, &response).await?;
                Ok(Some(response))
            }
            Err(e) => {
                let reason = e.to_string();
                obs::emit_handshake("fail", &reason);
                self.log_step("handshake", "fail", None, Some(reason.clone()))?;
                for def in &config.components {
                    self.invoker.events().append(
                        InvocationEvent::new(&def.name, InvocationKind::Handshake)
                            .with_agent("crown")
                            .with_error(reason.as_str()),
                    )?;
                    self.invoker.events().append(
                        InvocationEvent::new(&def.name, InvocationKind::Fallback)
                            .with_agent(&self.settings.fallback_agent)
                            .with_error(reason.as_str()),
                    )?;
                }
                Ok(None)
            }
        }
    }

    /// Launch every required capability Crown did not advertise.
    async fn ensure_capabilities(&self, config: &BootConfig, response: &CrownResponse) -> Result<()> {
        for req in &config.capabilities {
            if has_capability(&response.capabilities, &req.name) {
                continue;
            }
            tracing::info!(capability = %req.name, "required capability missing; launching");
            let ok = match run_to_completion(&req.launch, self.settings.agent_timeout).await {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::warn!(capability = %req.name, error = %e, "capability launch failed");
                    false
                }
            };
            let status = if ok { "success" } else { "failure" };
            self.log_step("model_launch", status, None, Some(req.name.clone()))?;
            let name = req.name.clone();
            self.state.update(|s| {
                if !s.launched_models.contains(&name) {
                    s.launched_models.push(name);
                }
            })?;
            if let Some(crown) = &self.crown {
                let label = format!("{}_launch", req.name.replace(['/', '\\', ' '], "_"));
                if let Err(e) = crown.archive_pair(
                    &label,
                    &json!({ "event": "model_launch", "model": req.name }),
                    &json!({ "status": status }),
                ) {
                    tracing::warn!(error = %e, "could not archive model launch");
                }
            }
        }
        Ok(())
    }

    /// First launch plus `retries` relaunches with exponential backoff.
    async fn launch_with_retries(
        &self,
        def: &ComponentDef,
        lifecycle: &mut ComponentLifecycle,
    ) -> Result<(std::result::Result<Box<dyn ProcessHandle>, String>, u32)> {
        let total = self.options.retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=total {
            if attempt == 1 {
                lifecycle.transition(ComponentState::Launching)?;
            }
            obs::emit_launch(&def.name, attempt);
            self.log_step("launch", "start", Some(&def.name), None)?;
            match self.runner.launch_component(def).await {
                Ok(handle) => {
                    lifecycle.transition(ComponentState::Healthy)?;
                    self.log_step("launch", "success", Some(&def.name), None)?;
                    return Ok((Ok(handle), attempt));
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::error!(component = %def.name, attempt, error = %last_error, "launch failed");
                    self.log_step("launch", "fail", Some(&def.name), Some(last_error.clone()))?;
                    if attempt == 1 {
                        lifecycle.transition(ComponentState::Failed)?;
                        lifecycle.transition(ComponentState::Retrying)?;
                    }
                    if attempt < total {
                        let delay =
                            backoff_delay(self.options.backoff_base, attempt, self.options.max_backoff);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
        Ok((Err(last_error), total))
    }

    async fn bounded_remediation(
        &self,
        def: &ComponentDef,
        error: &str,
        tracker: &mut FailureTracker,
    ) -> Result<Remediation> {
        let outcome = self
            .invoker
            .retry_with_ai(def, error, self.options.remote_attempts, tracker, &self.runner)
            .await?;
        Ok(match outcome.handle {
            Some(handle) => Remediation::Recovered {
                handle,
                attempts: outcome.attempts_used,
            },
            None => Remediation::Exhausted {
                attempts: outcome.attempts_used,
                error: outcome.last_error,
            },
        })
    }

    /// Remediate until a patch leads to a healthy relaunch or the operator aborts.
    async fn long_task(
        &self,
        def: &ComponentDef,
        error: &str,
        tracker: &mut FailureTracker,
    ) -> Result<Remediation> {
        let mut abort = self.abort.clone();
        let mut error = error.to_string();
        let mut attempt: u32 = 0;

        loop {
            if *abort.borrow() {
                self.record_long_task(def, attempt, None, false, &error, true)?;
                return Ok(Remediation::Interrupted { attempts: attempt });
            }
            attempt += 1;

            // An attempt always runs to completion; abort is honoured between
            // iterations and during the backoff.
            let report = self.invoker.attempt(def, &error, attempt, tracker).await?;
            self.record_long_task(def, attempt, Some(&report.agent), report.patched, &error, false)?;

            if report.patched {
                match self.runner.launch_component(def).await {
                    Ok(handle) => {
                        return Ok(Remediation::Recovered {
                            handle,
                            attempts: attempt,
                        })
                    }
                    Err(e) => {
                        error = e.to_string();
                        tracing::error!(component = %def.name, attempt, error = %error, "relaunch after patch failed");
                    }
                }
            }

            let delay = backoff_delay(self.options.backoff_base, attempt, self.options.max_backoff);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = abort_requested(&mut abort) => {}
                }
            }
        }
    }

    fn record_long_task(
        &self,
        def: &ComponentDef,
        attempt: u32,
        agent: Option<&str>,
        patched: bool,
        error: &str,
        aborted: bool,
    ) -> Result<()> {
        self.long_task_log.append(&LongTaskEntry {
            component: def.name.clone(),
            attempt,
            agent: agent.map(str::to_string),
            patched,
            error: Some(error.to_string()),
            aborted,
            timestamp: Utc::now(),
        })?;
        Ok(())
    }

    /// Quarantine, alert and roll the roster back.
    fn fail_fast(&self, def: &ComponentDef, error: &str, attempts: u32) -> Result<()> {
        let roster = self.invoker.roster();
        let (last_agent, ladder_exhausted) = match roster.load() {
            Ok(r) => {
                let idx = r.active_index();
                (
                    r.active_entry().map(|a| a.name.clone()),
                    idx.map(|i| i + 1 >= r.agents.len()).unwrap_or(false),
                )
            }
            Err(_) => (None, false),
        };

        let issue = classify_issue(error);
        self.quarantine.quarantine(
            &def.name,
            issue,
            remediation_hint(issue),
            Some(json!({
                "error": error,
                "attempts": attempts,
                "agent": last_agent,
                "ladder_exhausted": ladder_exhausted,
            })),
        )?;

        let restored = roster.store().restore_backup()?;
        roster.invalidate();
        obs::emit_roster_rollback(restored);

        self.alerts.send(
            &Alert::new(
                Severity::Critical,
                format!("{} is irrecoverable; boot aborted", def.name),
            )
            .for_component(&def.name)
            .with_context(json!({
                "error": error,
                "issue_type": issue,
                "attempts": attempts,
                "agent": last_agent,
                "ladder_exhausted": ladder_exhausted,
                "roster_restored": restored,
            })),
        )?;
        Ok(())
    }
}

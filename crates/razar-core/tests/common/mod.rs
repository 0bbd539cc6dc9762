//! Shared fixtures for orchestrator-level tests.
//!
//! Everything external is faked: processes never spawn, agents answer from a
//! script, patch tests pass or fail on demand, storage lives in memory.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::watch;

use razar_core::invoker::InvokerConfig;
use razar_core::{
    AgentFactory, AiInvoker, BootDeps, BootOptions, BootOrchestrator, ComponentDef,
    ComponentRunner, CrownHandshake, EscalationContext, HealthProbe, MapEnv, PatchApplier,
    PatchSuggestion, ProbeRegistry, ProcessHandle, ProcessLauncher, QuarantineManager,
    RazarMetrics, RazarSettings, RecordingAlertSink, RemediationAgent, Result, RosterCache,
    TestRunner,
};
use razar_state::fakes::{
    MemoryHistoryStore, MemoryInvocationLog, MemoryQuarantineStore, MemoryRosterStore,
};
use razar_state::{
    AgentEntry, AgentRoster, InvocationEvent, InvocationKind, InvocationLog, JsonlLog,
    StorageError, StorageResult,
};

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

pub struct FakeProcess {
    component: String,
    terminated: Arc<Mutex<Vec<String>>>,
    exited: bool,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn component(&self) -> &str {
        &self.component
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }

    async fn terminate(&mut self) -> Result<()> {
        self.exited = true;
        self.terminated.lock().unwrap().push(self.component.clone());
        Ok(())
    }
}

/// Records every spawn and termination; never fails to spawn.
#[derive(Default)]
pub struct FakeLauncher {
    spawned: Mutex<Vec<String>>,
    terminated: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, component: &str, _argv: &[String]) -> Result<Box<dyn ProcessHandle>> {
        self.spawned.lock().unwrap().push(component.to_string());
        Ok(Box::new(FakeProcess {
            component: component.to_string(),
            terminated: self.terminated.clone(),
            exited: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// Healthy once the file at `path` reads `fixed`.
pub struct MarkerProbe {
    pub path: PathBuf,
}

#[async_trait]
impl HealthProbe for MarkerProbe {
    fn describe(&self) -> String {
        format!("marker {}", self.path.display())
    }

    async fn probe(&self) -> bool {
        std::fs::read_to_string(&self.path)
            .map(|s| s.trim() == "fixed")
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Scripted agent responses plus a record of every context received.
#[derive(Default)]
pub struct Script {
    responses: Mutex<VecDeque<Vec<PatchSuggestion>>>,
    received: Mutex<Vec<(String, EscalationContext)>>,
    /// Flip this sender to `true` on the n-th invocation
    abort_on: Mutex<Option<(usize, watch::Sender<bool>)>>,
}

impl Script {
    pub fn push(&self, suggestions: Vec<PatchSuggestion>) {
        self.responses.lock().unwrap().push_back(suggestions);
    }

    pub fn received(&self) -> Vec<(String, EscalationContext)> {
        self.received.lock().unwrap().clone()
    }

    pub fn abort_on(&self, invocation: usize, tx: watch::Sender<bool>) {
        *self.abort_on.lock().unwrap() = Some((invocation, tx));
    }
}

pub struct ScriptedAgent {
    name: String,
    script: Arc<Script>,
}

#[async_trait]
impl RemediationAgent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &EscalationContext) -> Result<Vec<PatchSuggestion>> {
        let count = {
            let mut received = self.script.received.lock().unwrap();
            received.push((self.name.clone(), ctx.clone()));
            received.len()
        };
        if let Some((n, tx)) = self.script.abort_on.lock().unwrap().as_ref() {
            if count >= *n {
                let _ = tx.send(true);
            }
        }
        Ok(self
            .script
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

pub struct ScriptedFactory {
    pub script: Arc<Script>,
}

impl AgentFactory for ScriptedFactory {
    fn build(
        &self,
        entry: &AgentEntry,
        _credential: Option<String>,
    ) -> Result<Arc<dyn RemediationAgent>> {
        Ok(Arc::new(ScriptedAgent {
            name: entry.name.clone(),
            script: self.script.clone(),
        }))
    }
}

/// Patch test commands pass or fail by flag, without running anything.
///
/// `pass` governs the sandboxed run, `live_pass` the in-place one.
pub struct FlagTestRunner {
    pub pass: AtomicBool,
    pub live_pass: AtomicBool,
    /// Flipped to `true` while the in-place run is in progress
    abort_during_live: Mutex<Option<watch::Sender<bool>>>,
}

impl FlagTestRunner {
    pub fn new(pass: bool) -> Self {
        Self {
            pass: AtomicBool::new(pass),
            live_pass: AtomicBool::new(pass),
            abort_during_live: Mutex::new(None),
        }
    }

    pub fn abort_during_live(&self, tx: watch::Sender<bool>) {
        *self.abort_during_live.lock().unwrap() = Some(tx);
    }
}

#[async_trait]
impl TestRunner for FlagTestRunner {
    async fn run(&self, _workdir: &Path, env: &[(String, String)], _tests: &[String]) -> Result<bool> {
        let sandboxed = env.iter().any(|(k, _)| k == "RAZAR_SANDBOX");
        if sandboxed {
            return Ok(self.pass.load(Ordering::SeqCst));
        }
        {
            let guard = self.abort_during_live.lock().unwrap();
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(true);
            }
        }
        tokio::task::yield_now().await;
        Ok(self.pass.load(Ordering::SeqCst) && self.live_pass.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Delegates to a memory log but fails the n-th `attempt` append.
pub struct FlakyInvocationLog {
    inner: Arc<MemoryInvocationLog>,
    fail_on: usize,
    attempts: Mutex<usize>,
}

impl InvocationLog for FlakyInvocationLog {
    fn append(&self, event: InvocationEvent) -> StorageResult<InvocationEvent> {
        if event.event == InvocationKind::Attempt {
            let mut seen = self.attempts.lock().unwrap();
            *seen += 1;
            if *seen == self.fail_on {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
        }
        self.inner.append(event)
    }

    fn events_for(&self, component: &str) -> StorageResult<Vec<InvocationEvent>> {
        self.inner.events_for(component)
    }

    fn all(&self) -> StorageResult<Vec<InvocationEvent>> {
        self.inner.all()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub fn roster(names: &[&str]) -> AgentRoster {
    AgentRoster::new(names[0], names.iter().map(|n| AgentEntry::new(*n)).collect())
}

pub fn component(name: &str) -> ComponentDef {
    ComponentDef::new(name, vec!["run".to_string(), name.to_string()])
        .with_tests(vec!["true".to_string()])
}

pub fn fast_options() -> BootOptions {
    BootOptions {
        handshake: false,
        backoff_base: Duration::ZERO,
        max_backoff: Duration::ZERO,
        ..BootOptions::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub settings: RazarSettings,
    pub events: Arc<MemoryInvocationLog>,
    pub roster_store: Arc<MemoryRosterStore>,
    pub quarantine_store: Arc<MemoryQuarantineStore>,
    pub history: Arc<MemoryHistoryStore>,
    pub alerts: Arc<RecordingAlertSink>,
    pub launcher: Arc<FakeLauncher>,
    pub script: Arc<Script>,
    pub tests: Arc<FlagTestRunner>,
    pub probes: ProbeRegistry,
    pub escalation_threshold: u32,
    /// Fail the n-th attempt append to the invocation log
    pub fail_attempt_append: Option<usize>,
    pub metrics: Arc<RazarMetrics>,
}

impl Harness {
    pub fn new(agents: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = RazarSettings::for_home(dir.path());
        Self {
            settings,
            dir,
            metrics: Arc::new(RazarMetrics::new().unwrap()),
            events: Arc::new(MemoryInvocationLog::new()),
            roster_store: Arc::new(MemoryRosterStore::with_roster(roster(agents))),
            quarantine_store: Arc::new(MemoryQuarantineStore::new()),
            history: Arc::new(MemoryHistoryStore::new()),
            alerts: Arc::new(RecordingAlertSink::new()),
            launcher: Arc::new(FakeLauncher::default()),
            script: Arc::new(Script::default()),
            tests: Arc::new(FlagTestRunner::new(true)),
            probes: ProbeRegistry::new(),
            escalation_threshold: razar_core::settings::DEFAULT_ESCALATION_THRESHOLD,
            fail_attempt_append: None,
        }
    }

    pub fn home(&self) -> &Path {
        self.dir.path()
    }

    pub fn register_probe(&mut self, name: &str, probe: Arc<dyn HealthProbe>) {
        self.probes.register(name, probe);
    }

    pub fn quarantine_manager(&self) -> QuarantineManager {
        QuarantineManager::new(self.quarantine_store.clone())
    }

    pub fn roster_cache(&self) -> Arc<RosterCache> {
        Arc::new(RosterCache::new(self.roster_store.clone()))
    }

    pub fn patcher(&self) -> PatchApplier {
        PatchApplier::new(
            self.home(),
            &self.settings.patch_backup_dir,
            Arc::new(JsonlLog::new(&self.settings.patch_log)),
            self.tests.clone(),
            self.quarantine_manager(),
        )
    }

    pub fn metrics(&self) -> Arc<RazarMetrics> {
        self.metrics.clone()
    }

    pub fn invoker(&self) -> AiInvoker {
        let events: Arc<dyn InvocationLog> = match self.fail_attempt_append {
            Some(n) => Arc::new(FlakyInvocationLog {
                inner: self.events.clone(),
                fail_on: n,
                attempts: Mutex::new(0),
            }),
            None => self.events.clone(),
        };
        AiInvoker::new(
            events,
            self.roster_cache(),
            Arc::new(MapEnv::new()),
            Arc::new(ScriptedFactory {
                script: self.script.clone(),
            }),
            self.patcher(),
            self.metrics(),
            InvokerConfig {
                escalation_threshold: self.escalation_threshold,
                backoff_base: Duration::ZERO,
                backoff_cap: Duration::ZERO,
                ..InvokerConfig::default()
            },
        )
    }

    pub fn runner(&self) -> ComponentRunner {
        ComponentRunner::new(self.launcher.clone(), self.probes.clone())
    }

    pub fn orchestrator(
        &self,
        options: BootOptions,
        crown: Option<CrownHandshake>,
        abort: watch::Receiver<bool>,
    ) -> BootOrchestrator {
        let deps = BootDeps {
            settings: self.settings.clone(),
            runner: self.runner(),
            invoker: self.invoker(),
            quarantine: self.quarantine_manager(),
            crown,
            alerts: self.alerts.clone(),
            history: self.history.clone(),
            metrics: self.metrics(),
        };
        BootOrchestrator::new(deps, options, abort)
    }
}

/// A receiver whose sender is already gone; abort never fires.
pub fn no_abort() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

//! RAZAR Core Library
//!
//! Boot orchestration, AI-assisted remediation and self-repair for a set of
//! dependent components. Persistence lives in `razar-state`; this crate holds
//! the control flow and every external collaborator behind a trait.

pub mod agent;
pub mod alert;
pub mod credentials;
pub mod crown;
pub mod domain;
pub mod history;
pub mod invoker;
pub mod launch;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod patch;
pub mod probe;
pub mod process;
pub mod quarantine;
pub mod recovery;
pub mod roster;
pub mod rotation;
pub mod settings;
pub mod telemetry;

pub use domain::{
    load_config, parse_config, BootConfig, CapabilityRequirement, ComponentDef,
    ComponentLifecycle, ComponentState, ProbeSpec, RazarError, Result,
};

pub use agent::{
    parse_suggestions, AgentFactory, EscalationContext, HttpAgent, HttpAgentFactory,
    PatchSuggestion, RemediationAgent,
};
pub use alert::{Alert, AlertSink, JsonlAlertSink, RecordingAlertSink, Severity};
pub use credentials::{
    expand_vars, missing_credentials, resolve_credential, validate_roster, EnvSource, MapEnv,
    OverlayEnv, ProcessEnv,
};
pub use crown::{
    has_capability, normalize_capability, CrownHandshake, CrownResponse, CrownTransport,
    HandshakeError, MissionBrief, WsCrownTransport,
};
pub use history::{finalize_metrics, summarize_run};
pub use invoker::{AiInvoker, FailureTracker, InvokerConfig, RetryOutcome};
pub use launch::ComponentRunner;
pub use metrics::{metrics_router, serve_metrics, MetricsError, RazarMetrics};
pub use orchestrator::{BootDeps, BootOptions, BootOrchestrator, BootOutcome, BootReport};
pub use patch::{CommandTestRunner, PatchApplier, PatchOutcome, TestRunner};
pub use probe::{HealthProbe, ProbeRegistry, StaticProbe};
pub use process::{ProcessHandle, ProcessLauncher, TokioLauncher};
pub use quarantine::{classify_issue, QuarantineManager};
pub use recovery::{PatchInfo, RecoveryManager};
pub use roster::{default_roster, RosterCache};
pub use rotation::{rotate_keys, RotationError, RotationResult, RotationSpec};
pub use settings::RazarSettings;
pub use telemetry::init_tracing;

//! Structured observability hooks for boot lifecycle events.
//!
//! Every event carries a stable `event = "..."` field so log pipelines can
//! filter without parsing messages.

use tracing::{info, warn};

use crate::domain::ComponentState;

/// Boot-scoped span; attach it with `tracing::Instrument` so it follows the
/// run across await points.
pub fn boot_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("razar.boot", run_id = %run_id)
}

pub fn emit_boot_started(run_id: &str, components: usize) {
    info!(event = "boot.started", run_id = %run_id, components = components);
}

pub fn emit_boot_finished(run_id: &str, success: bool, duration_ms: u64, quarantined: usize) {
    info!(
        event = "boot.finished",
        run_id = %run_id,
        success = success,
        duration_ms = duration_ms,
        quarantined = quarantined,
    );
}

pub fn emit_state_transition(component: &str, from: ComponentState, to: ComponentState) {
    tracing::debug!(
        event = "component.transition",
        component = %component,
        from = %from,
        to = %to,
    );
}

pub fn emit_launch(component: &str, attempt: u32) {
    info!(event = "component.launch", component = %component, attempt = attempt);
}

pub fn emit_probe(component: &str, healthy: bool) {
    if healthy {
        info!(event = "component.probe", component = %component, healthy = true);
    } else {
        warn!(event = "component.probe", component = %component, healthy = false);
    }
}

pub fn emit_handshake(outcome: &str, detail: &str) {
    info!(event = "crown.handshake", outcome = %outcome, detail = %detail);
}

pub fn emit_agent_attempt(component: &str, agent: &str, attempt: u32, patched: bool) {
    info!(
        event = "agent.attempt",
        component = %component,
        agent = %agent,
        attempt = attempt,
        patched = patched,
    );
}

pub fn emit_escalation(component: &str, from: &str, to: &str) {
    warn!(event = "agent.escalation", component = %component, from = %from, to = %to);
}

pub fn emit_patch_result(component: &str, module: &str, success: bool) {
    info!(
        event = "patch.result",
        component = %component,
        module = %module,
        success = success,
    );
}

pub fn emit_quarantined(component: &str, issue_type: &str) {
    warn!(event = "quarantine.added", component = %component, issue_type = %issue_type);
}

pub fn emit_reactivated(component: &str, automated: bool) {
    info!(event = "quarantine.reactivated", component = %component, automated = automated);
}

pub fn emit_roster_rollback(restored: bool) {
    warn!(event = "roster.rollback", restored = restored);
}

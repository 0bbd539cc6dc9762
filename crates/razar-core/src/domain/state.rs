//! Per-component lifecycle state machine.
//!
//! ```text
//! PENDING -> LAUNCHING -> HEALTHY
//!                      -> FAILED -> RETRYING -> HEALTHY
//!                                            -> ESCALATING -> HEALTHY
//!                                                          -> QUARANTINED
//! PENDING -> QUARANTINED   (already quarantined or over the failure limit)
//! ```

use serde::{Deserialize, Serialize};

use super::error::{RazarError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentState {
    Pending,
    Launching,
    Healthy,
    Failed,
    Retrying,
    Escalating,
    Quarantined,
}

impl ComponentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ComponentState::Healthy | ComponentState::Quarantined)
    }

    pub fn can_transition_to(&self, next: ComponentState) -> bool {
        use ComponentState::*;
        matches!(
            (self, next),
            (Pending, Launching)
                | (Pending, Quarantined)
                | (Launching, Healthy)
                | (Launching, Failed)
                | (Failed, Retrying)
                | (Retrying, Healthy)
                | (Retrying, Escalating)
                | (Escalating, Healthy)
                | (Escalating, Quarantined)
        )
    }
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentState::Pending => "PENDING",
            ComponentState::Launching => "LAUNCHING",
            ComponentState::Healthy => "HEALTHY",
            ComponentState::Failed => "FAILED",
            ComponentState::Retrying => "RETRYING",
            ComponentState::Escalating => "ESCALATING",
            ComponentState::Quarantined => "QUARANTINED",
        };
        f.write_str(s)
    }
}

/// Tracks one component's state and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct ComponentLifecycle {
    component: String,
    state: ComponentState,
}

impl ComponentLifecycle {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: ComponentState::Pending,
        }
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn transition(&mut self, next: ComponentState) -> Result<ComponentState> {
        if !self.state.can_transition_to(next) {
            return Err(RazarError::IllegalTransition {
                component: self.component.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let prev = self.state;
        self.state = next;
        crate::obs::emit_state_transition(&self.component, prev, next);
        Ok(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ComponentState::*;

    #[test]
    fn happy_path_reaches_healthy() {
        let mut lc = ComponentLifecycle::new("db");
        lc.transition(Launching).unwrap();
        lc.transition(Healthy).unwrap();
        assert!(lc.state().is_terminal());
    }

    #[test]
    fn full_escalation_path_reaches_quarantine() {
        let mut lc = ComponentLifecycle::new("db");
        for next in [Launching, Failed, Retrying, Escalating, Quarantined] {
            lc.transition(next).unwrap();
        }
        assert_eq!(lc.state(), Quarantined);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut lc = ComponentLifecycle::new("db");
        let err = lc.transition(Healthy).unwrap_err();
        assert!(matches!(err, RazarError::IllegalTransition { .. }));
        assert_eq!(lc.state(), Pending);

        lc.transition(Launching).unwrap();
        lc.transition(Healthy).unwrap();
        assert!(lc.transition(Failed).is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(Quarantined.is_terminal());
        assert!(!Escalating.is_terminal());
    }
}

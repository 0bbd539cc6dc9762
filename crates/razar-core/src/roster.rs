//! Agent roster access with revision-checked caching.
//!
//! The roster's agent order is the escalation ladder. `RosterCache` reloads
//! whenever the store's revision changes and can be invalidated explicitly
//! (rotation does this after rewriting credentials).

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use razar_state::{normalize_agent_name, AgentEntry, AgentRoster, RosterStore};

use crate::domain::{RazarError, Result};

/// Ladder used by `default_roster`: supervisory peer, coding agent,
/// cross-file reviewer, final high-capability agent.
pub const DEFAULT_LADDER: [(&str, &str); 4] = [
    ("crown", "CROWN_API_KEY"),
    ("coder", "CODER_API_KEY"),
    ("reviewer", "REVIEWER_API_KEY"),
    ("sentinel", "SENTINEL_API_KEY"),
];

/// Roster template following [`DEFAULT_LADDER`], with no endpoints set.
pub fn default_roster() -> AgentRoster {
    AgentRoster::new(
        DEFAULT_LADDER[0].0,
        DEFAULT_LADDER
            .iter()
            .map(|(name, env)| AgentEntry::new(*name).with_credential_env(*env))
            .collect(),
    )
}

/// Structural checks: non-empty unique names and an `active` that exists.
pub fn validate_roster_shape(roster: &AgentRoster) -> Result<()> {
    if roster.agents.is_empty() {
        return Err(RazarError::Configuration("agent roster is empty".to_string()));
    }
    let mut seen = HashSet::new();
    for agent in &roster.agents {
        let key = normalize_agent_name(&agent.name);
        if key.is_empty() {
            return Err(RazarError::Configuration(
                "agent roster has an unnamed agent".to_string(),
            ));
        }
        if !seen.insert(key) {
            return Err(RazarError::Configuration(format!(
                "agent roster lists {} twice",
                agent.name
            )));
        }
    }
    if roster.active_index().is_none() {
        return Err(RazarError::Configuration(format!(
            "active agent {} is not in the roster",
            roster.active
        )));
    }
    Ok(())
}

/// One ladder step taken by [`RosterCache::advance`].
#[derive(Debug, Clone, PartialEq)]
pub struct LadderStep {
    pub from: AgentEntry,
    pub to: AgentEntry,
}

/// Cached view over a [`RosterStore`].
pub struct RosterCache {
    store: Arc<dyn RosterStore>,
    cached: Mutex<Option<(u64, AgentRoster)>>,
}

impl RosterCache {
    pub fn new(store: Arc<dyn RosterStore>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn RosterStore> {
        &self.store
    }

    fn slot(&self) -> MutexGuard<'_, Option<(u64, AgentRoster)>> {
        self.cached.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop the cached roster so the next `load` reads the store.
    pub fn invalidate(&self) {
        *self.slot() = None;
    }

    /// The validated roster, reloaded if the store changed.
    pub fn load(&self) -> Result<AgentRoster> {
        let revision = self.store.revision()?;
        let mut slot = self.slot();
        if let Some((rev, roster)) = slot.as_ref() {
            if *rev == revision {
                return Ok(roster.clone());
            }
        }
        let roster = self.store.load()?;
        validate_roster_shape(&roster)?;
        *slot = Some((revision, roster.clone()));
        Ok(roster)
    }

    /// The currently active agent.
    pub fn active(&self) -> Result<AgentEntry> {
        let roster = self.load()?;
        roster
            .active_entry()
            .cloned()
            .ok_or_else(|| RazarError::Configuration("active agent missing".to_string()))
    }

    /// Move `active` one step down the ladder.
    ///
    /// Returns `None` when the active agent is already last; the roster is
    /// left untouched in that case.
    pub fn advance(&self) -> Result<Option<LadderStep>> {
        self.invalidate();
        let mut roster = self.load()?;
        let idx = roster
            .active_index()
            .ok_or_else(|| RazarError::Configuration("active agent missing".to_string()))?;
        let Some(next) = roster.agents.get(idx + 1).cloned() else {
            return Ok(None);
        };
        let from = roster.agents[idx].clone();
        roster.active = next.name.clone();
        self.store.save(&roster)?;
        self.invalidate();
        Ok(Some(LadderStep { from, to: next }))
    }

    /// Persist `roster` and drop the cache.
    pub fn save(&self, roster: &AgentRoster) -> Result<()> {
        validate_roster_shape(roster)?;
        self.store.save(roster)?;
        self.invalidate();
        Ok(())
    }
}

//! Launch-and-probe for a single component.

use std::sync::Arc;

use crate::domain::{ComponentDef, RazarError, Result};
use crate::obs;
use crate::probe::ProbeRegistry;
use crate::process::{ProcessHandle, ProcessLauncher};

/// Starts a component and checks its health once.
#[derive(Clone)]
pub struct ComponentRunner {
    launcher: Arc<dyn ProcessLauncher>,
    probes: ProbeRegistry,
}

impl ComponentRunner {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, probes: ProbeRegistry) -> Self {
        Self { launcher, probes }
    }

    pub fn probes(&self) -> &ProbeRegistry {
        &self.probes
    }

    /// Spawn `def` and block on its health probe.
    ///
    /// On probe failure the process is terminated and awaited before the
    /// launch error is returned. A component with no probe is assumed healthy.
    pub async fn launch_component(&self, def: &ComponentDef) -> Result<Box<dyn ProcessHandle>> {
        let mut handle = self.launcher.spawn(&def.name, &def.command).await?;

        let probe = match self.probes.resolve(def) {
            Ok(p) => p,
            Err(e) => {
                handle.terminate().await.ok();
                return Err(e);
            }
        };
        let Some(probe) = probe else {
            tracing::warn!(component = %def.name, "no health probe configured; assuming healthy");
            return Ok(handle);
        };

        let healthy = probe.probe().await;
        obs::emit_probe(&def.name, healthy);
        if healthy {
            return Ok(handle);
        }

        if let Err(e) = handle.terminate().await {
            tracing::warn!(component = %def.name, error = %e, "terminate after failed probe");
        }
        Err(RazarError::LaunchFailure {
            component: def.name.clone(),
            reason: format!("health check failed ({})", probe.describe()),
        })
    }
}

//! Process launching behind a trait so the boot loop can be driven by fakes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::domain::{RazarError, Result};

/// A running component process owned by the orchestrator.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn component(&self) -> &str;

    fn pid(&self) -> Option<u32>;

    /// Whether the process has already exited.
    fn has_exited(&mut self) -> bool;

    /// Stop the process and wait for it to exit.
    async fn terminate(&mut self) -> Result<()>;
}

/// Starts component processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, component: &str, argv: &[String]) -> Result<Box<dyn ProcessHandle>>;
}

/// `tokio::process` launcher.
#[derive(Debug, Clone)]
pub struct TokioLauncher {
    cwd: Option<PathBuf>,
    grace: Duration,
}

impl Default for TokioLauncher {
    fn default() -> Self {
        Self {
            cwd: None,
            grace: Duration::from_secs(5),
        }
    }
}

impl TokioLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, component: &str, argv: &[String]) -> Result<Box<dyn ProcessHandle>> {
        let (program, args) = argv.split_first().ok_or_else(|| RazarError::LaunchFailure {
            component: component.to_string(),
            reason: "empty command".to_string(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        let child = cmd.spawn().map_err(|e| RazarError::LaunchFailure {
            component: component.to_string(),
            reason: format!("spawn {program}: {e}"),
        })?;
        tracing::debug!(component = %component, pid = ?child.id(), "process spawned");
        Ok(Box::new(TokioProcess {
            component: component.to_string(),
            child,
            grace: self.grace,
        }))
    }
}

/// Handle over a `tokio::process::Child`.
#[derive(Debug)]
pub struct TokioProcess {
    component: String,
    child: Child,
    grace: Duration,
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    fn component(&self) -> &str {
        &self.component
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.child.start_kill()?;
        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(status) => {
                tracing::debug!(component = %self.component, status = ?status.ok(), "process exited");
                Ok(())
            }
            Err(_) => Err(RazarError::LaunchFailure {
                component: self.component.clone(),
                reason: format!("process did not exit within {:?}", self.grace),
            }),
        }
    }
}

/// Run a one-shot command to completion, returning whether it succeeded.
pub async fn run_to_completion(argv: &[String], timeout: Duration) -> Result<bool> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RazarError::Configuration("empty command".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.status()).await {
        Ok(status) => Ok(status?.success()),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_terminate_long_running_process() {
        let launcher = TokioLauncher::new();
        let mut handle = launcher
            .spawn("sleeper", &["sleep".to_string(), "30".to_string()])
            .await
            .unwrap();
        assert!(handle.pid().is_some());
        assert!(!handle.has_exited());
        handle.terminate().await.unwrap();
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn spawn_missing_binary_is_launch_failure() {
        let launcher = TokioLauncher::new();
        let err = launcher
            .spawn("ghost", &["/no/such/binary".to_string()])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RazarError::LaunchFailure { component, .. } if component == "ghost"));
    }

    #[tokio::test]
    async fn run_to_completion_reports_status() {
        let t = Duration::from_secs(5);
        assert!(run_to_completion(&["true".to_string()], t).await.unwrap());
        assert!(!run_to_completion(&["false".to_string()], t).await.unwrap());
    }
}

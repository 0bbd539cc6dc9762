//! RAZAR - resilient boot and self-repair orchestrator CLI
//!
//! ## Commands
//!
//! - `boot`: launch the configured components in priority order
//! - `rotate-keys`: rotate remote agent credentials from secrets metadata
//! - `quarantine`: list, reactivate or annotate quarantined components
//! - `check-credentials`: verify every agent credential resolves
//! - `init-roster`: write the default escalation ladder

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, Level};

use razar_core::rotation::{DEFAULT_PREFIX, DEFAULT_SUFFIX};
use razar_core::{
    default_roster, load_config, missing_credentials, rotate_keys, serve_metrics, BootOptions,
    BootOrchestrator, BootOutcome, ProbeRegistry, ProcessEnv, QuarantineManager, RazarMetrics,
    RazarSettings, RosterCache,
};
use razar_state::{FsQuarantineStore, FsRosterStore, RosterStore};

#[derive(Parser)]
#[command(name = "razar")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resilient boot and self-repair orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// State root (overrides RAZAR_HOME)
    #[arg(long, global = true, env = "RAZAR_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch components in priority order with retries and AI remediation
    Boot {
        /// Boot configuration (JSON)
        #[arg(short, long, default_value = "config/boot_config.json")]
        config: PathBuf,

        /// Local relaunches after a failed launch
        #[arg(long, default_value_t = 3)]
        retries: u32,

        /// Remediation attempts after local retries are exhausted
        #[arg(long, default_value_t = 3)]
        remote_attempts: u32,

        /// Quarantine a component once its cumulative failures reach N (0 disables)
        #[arg(long, default_value_t = 3)]
        failure_limit: u32,

        /// Remediate until success or Ctrl-C instead of a bounded number of attempts
        #[arg(long)]
        long_task: bool,

        /// Skip the Crown mission-brief handshake
        #[arg(long)]
        no_handshake: bool,

        /// Base delay for exponential backoff, in seconds
        #[arg(long, default_value_t = 1)]
        backoff_secs: u64,

        /// Serve GET /metrics on RAZAR_METRICS_PORT while running
        #[arg(long)]
        serve_metrics: bool,

        /// Exit after a successful boot and leave components running
        #[arg(long)]
        detach: bool,
    },

    /// Rotate remote agent credentials
    RotateKeys {
        /// Directory containing rotation metadata (JSON or YAML)
        #[arg(long)]
        secrets_dir: PathBuf,

        /// Roster used by metadata entries without their own config path
        #[arg(long)]
        config: Option<PathBuf>,

        /// Rewrite the roster instead of validating a temporary copy
        #[arg(long)]
        apply: bool,

        #[arg(long, default_value = DEFAULT_PREFIX)]
        prefix: String,

        #[arg(long, default_value = DEFAULT_SUFFIX)]
        suffix: String,
    },

    /// Manage quarantined components
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },

    /// Check that every agent credential in the roster resolves
    CheckCredentials,

    /// Write the default agent roster
    InitRoster {
        /// Overwrite an existing roster
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum QuarantineAction {
    /// List quarantined components
    List,

    /// Remove a component from quarantine
    Reactivate {
        name: String,

        /// Confirm the fix has been verified
        #[arg(long)]
        verified: bool,

        #[arg(long)]
        note: Option<String>,
    },

    /// Attach diagnostics (JSON) to a component
    Diagnose { name: String, data: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    razar_core::init_tracing(cli.json, level);

    let mut settings = RazarSettings::from_env();
    if let Some(home) = &cli.home {
        let env_tunables = settings.clone();
        settings = RazarSettings::for_home(home);
        settings.escalation_threshold = env_tunables.escalation_threshold;
        settings.metrics_port = env_tunables.metrics_port;
        settings.crown_url = env_tunables.crown_url;
        settings.crown_identity = env_tunables.crown_identity;
        settings.fallback_agent = env_tunables.fallback_agent;
    }

    match cli.command {
        Commands::Boot {
            config,
            retries,
            remote_attempts,
            failure_limit,
            long_task,
            no_handshake,
            backoff_secs,
            serve_metrics,
            detach,
        } => {
            let options = BootOptions {
                retries,
                remote_attempts,
                failure_limit,
                long_task,
                handshake: !no_handshake,
                backoff_base: Duration::from_secs(backoff_secs),
                ..BootOptions::default()
            };
            cmd_boot(settings, &config, options, serve_metrics, detach).await
        }
        Commands::RotateKeys {
            secrets_dir,
            config,
            apply,
            prefix,
            suffix,
        } => cmd_rotate_keys(&settings, &secrets_dir, config, apply, &prefix, &suffix),
        Commands::Quarantine { action } => cmd_quarantine(&settings, action),
        Commands::CheckCredentials => cmd_check_credentials(&settings),
        Commands::InitRoster { force } => cmd_init_roster(&settings, force),
    }
}

async fn cmd_boot(
    settings: RazarSettings,
    config_path: &Path,
    options: BootOptions,
    serve: bool,
    detach: bool,
) -> Result<()> {
    let probes = ProbeRegistry::new();
    let config = load_config(config_path, &probes)
        .with_context(|| format!("Failed to load boot config {:?}", config_path))?;

    let metrics = RazarMetrics::global().context("Failed to register metrics")?;
    if serve {
        serve_metrics(metrics.clone(), settings.metrics_port)
            .await
            .context("Failed to start metrics endpoint")?;
    }

    let (abort_tx, abort_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; aborting");
            let _ = abort_tx.send(true);
        }
    });

    let orchestrator =
        BootOrchestrator::from_settings(settings, options, probes, metrics, abort_rx.clone())
            .context("Failed to set up orchestrator")?;
    let mut report = orchestrator.boot(&config).await.context("Boot failed")?;

    println!(
        "Boot run {}: {} component(s), success rate {:.0}%, {:.1}s",
        report.run_id,
        report.run.components.len(),
        report.run.success_rate * 100.0,
        report.run.total_time
    );
    for name in &report.quarantined {
        println!("  quarantined: {}", name);
    }

    if let BootOutcome::Aborted { component, reason } = &report.outcome {
        anyhow::bail!("boot aborted at '{}': {}", component, reason);
    }

    if detach {
        println!("Detached; {} component(s) left running", report.handles.len());
        return Ok(());
    }

    println!("All components healthy; press Ctrl-C to stop");
    let mut abort_rx = abort_rx;
    let _ = abort_rx.wait_for(|v| *v).await;
    report.shutdown().await;
    Ok(())
}

fn cmd_rotate_keys(
    settings: &RazarSettings,
    secrets_dir: &Path,
    config: Option<PathBuf>,
    apply: bool,
    prefix: &str,
    suffix: &str,
) -> Result<()> {
    let default_config = config.unwrap_or_else(|| settings.roster_path.clone());
    let results = rotate_keys(secrets_dir, &default_config, prefix, suffix, apply, &ProcessEnv)
        .context("Rotation failed")?;

    for r in results {
        let env_part = r
            .env_var
            .as_deref()
            .map(|v| format!(" env={}", v))
            .unwrap_or_default();
        let action = if r.applied { "applied" } else { "validated" };
        println!(
            "{} -> {}{} ({} using {:?})",
            r.agent, r.placeholder, env_part, action, r.config_path
        );
    }
    Ok(())
}

fn cmd_quarantine(settings: &RazarSettings, action: QuarantineAction) -> Result<()> {
    let manager = QuarantineManager::new(Arc::new(FsQuarantineStore::new(
        &settings.quarantine_dir,
        &settings.quarantine_log,
    )));

    match action {
        QuarantineAction::List => {
            let records = manager.list()?;
            if records.is_empty() {
                println!("No quarantined components.");
            }
            for r in records {
                println!(
                    "{}  {}  {}  ({})",
                    r.component,
                    r.issue_type,
                    r.fix_note,
                    r.quarantined_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        QuarantineAction::Reactivate {
            name,
            verified,
            note,
        } => {
            manager
                .reactivate(&name, verified, false, note.as_deref())
                .with_context(|| format!("Cannot reactivate '{}'", name))?;
            println!("Reactivated '{}'", name);
        }
        QuarantineAction::Diagnose { name, data } => {
            let value: serde_json::Value =
                serde_json::from_str(&data).context("Diagnostics must be JSON")?;
            manager.record_diagnostics(&name, value)?;
            println!("Recorded diagnostics for '{}'", name);
        }
    }
    Ok(())
}

fn cmd_check_credentials(settings: &RazarSettings) -> Result<()> {
    let cache = RosterCache::new(Arc::new(FsRosterStore::new(&settings.roster_path)));
    let roster = cache
        .load()
        .with_context(|| format!("Failed to load roster {:?}", settings.roster_path))?;

    let problems = missing_credentials(&roster, &ProcessEnv);
    for p in &problems {
        println!("missing: {}", p);
    }
    if !problems.is_empty() {
        anyhow::bail!("{} agent credential(s) unavailable", problems.len());
    }
    println!("All {} agent credential(s) resolve", roster.agents.len());
    Ok(())
}

fn cmd_init_roster(settings: &RazarSettings, force: bool) -> Result<()> {
    let store = FsRosterStore::new(&settings.roster_path);
    if settings.roster_path.exists() && !force {
        anyhow::bail!(
            "Roster already exists at {:?} (use --force to overwrite)",
            settings.roster_path
        );
    }
    store.save(&default_roster())?;
    println!("Wrote default roster to {:?}", settings.roster_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn boot_flags_parse() {
        let cli = Cli::try_parse_from([
            "razar",
            "boot",
            "--config",
            "boot.json",
            "--retries",
            "0",
            "--remote-attempts",
            "2",
            "--no-handshake",
        ])
        .unwrap();
        match cli.command {
            Commands::Boot {
                retries,
                remote_attempts,
                failure_limit,
                no_handshake,
                long_task,
                ..
            } => {
                assert_eq!(retries, 0);
                assert_eq!(remote_attempts, 2);
                assert_eq!(failure_limit, 3);
                assert!(no_handshake);
                assert!(!long_task);
            }
            _ => panic!("expected boot"),
        }
    }

    #[test]
    fn reactivate_without_verified_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RazarSettings::for_home(dir.path());
        let err = cmd_quarantine(
            &settings,
            QuarantineAction::Reactivate {
                name: "db".into(),
                verified: false,
                note: None,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("db"));
    }

    #[test]
    fn init_roster_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RazarSettings::for_home(dir.path());
        cmd_init_roster(&settings, false).unwrap();
        assert!(cmd_init_roster(&settings, false).is_err());
        cmd_init_roster(&settings, true).unwrap();
    }
}

//! Supervisor: gates on configuration completeness, spawns the agent
//! process as a child, and restarts it with exponential backoff on crash.
//!
//! Never touches the event bus, the router, or any extension state — that
//! all lives in the agent process this binary merely spawns and watches.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};
use yodoca_config::{EnvSecretStore, SandboxPaths, Settings};

#[derive(Parser, Debug)]
#[command(about = "Supervises the yodoca agent process")]
struct Args {
    /// Sandbox root directory.
    #[arg(long, default_value = ".")]
    sandbox: PathBuf,

    /// Path to the agent process binary.
    #[arg(long, default_value = "yodoca-agent")]
    agent_binary: PathBuf,

    /// Path to the onboarding subprocess binary, run when configuration is
    /// incomplete. Its internals are out of scope here; only its exit code
    /// (0 success, 1 user-cancelled, 2 retry) is observed.
    #[arg(long)]
    onboarding_binary: Option<PathBuf>,

    /// Maximum consecutive agent-process crashes before the supervisor gives up.
    #[arg(long, default_value_t = 5)]
    max_restarts: u32,

    /// Initial crash-restart backoff, in milliseconds.
    #[arg(long, default_value_t = 500)]
    restart_backoff_initial_ms: u64,

    /// Crash-restart backoff ceiling, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    restart_backoff_max_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    yodoca_telemetry::init_tracing();
    let args = Args::parse();
    std::process::exit(run(args).await?);
}

async fn run(args: Args) -> Result<i32> {
    let paths = SandboxPaths::new(&args.sandbox);
    let secrets = EnvSecretStore;
    let mut consecutive_crashes: u32 = 0;
    let mut backoff_ms = args.restart_backoff_initial_ms;

    loop {
        paths.take_restart_requested();

        let settings = load_settings(&paths)?;
        let state = settings.is_configured(&secrets);
        if !state.is_ok() {
            info!(reason = state.reason().unwrap_or("unknown"), "configuration incomplete, running onboarding");
            match run_onboarding(&args).await? {
                0 => continue,
                1 => {
                    info!("onboarding cancelled by user, shutting down");
                    return Ok(0);
                }
                2 => continue,
                other => {
                    warn!(code = other, "onboarding exited with unexpected code, retrying");
                    continue;
                }
            }
        }

        let mut child = Command::new(&args.agent_binary)
            .arg("--sandbox")
            .arg(&args.sandbox)
            .spawn()
            .with_context(|| format!("failed to spawn agent process `{}`", args.agent_binary.display()))?;

        match wait_for_child_or_signal(&mut child, &paths).await? {
            ChildOutcome::RestartRequested => {
                terminate(&mut child).await;
                consecutive_crashes = 0;
                backoff_ms = args.restart_backoff_initial_ms;
                continue;
            }
            ChildOutcome::Signalled => {
                terminate(&mut child).await;
                return Ok(0);
            }
            ChildOutcome::Exited(status) => {
                if status.success() {
                    consecutive_crashes = 0;
                    backoff_ms = args.restart_backoff_initial_ms;
                    continue;
                }

                consecutive_crashes += 1;
                error!(
                    crashes = consecutive_crashes,
                    code = status.code(),
                    "agent process exited with error"
                );

                if consecutive_crashes > args.max_restarts {
                    error!("max restart count exceeded, giving up");
                    return Ok(1);
                }

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(args.restart_backoff_max_ms);
            }
        }
    }
}

fn load_settings(paths: &SandboxPaths) -> Result<Settings> {
    let path = paths.settings_file();
    if !path.exists() {
        return Ok(Settings::default());
    }
    Settings::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

async fn run_onboarding(args: &Args) -> Result<i32> {
    let Some(binary) = &args.onboarding_binary else {
        error!("configuration incomplete and no --onboarding-binary was given");
        return Ok(1);
    };

    let status = Command::new(binary)
        .arg("--sandbox")
        .arg(&args.sandbox)
        .status()
        .await
        .with_context(|| format!("failed to run onboarding binary `{}`", binary.display()))?;
    Ok(status.code().unwrap_or(1))
}

enum ChildOutcome {
    Exited(ExitStatus),
    RestartRequested,
    Signalled,
}

async fn wait_for_child_or_signal(child: &mut Child, paths: &SandboxPaths) -> Result<ChildOutcome> {
    let mut restart_poll = tokio::time::interval(Duration::from_millis(500));
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            status = child.wait() => return Ok(ChildOutcome::Exited(status?)),
            _ = restart_poll.tick() => {
                if paths.take_restart_requested() {
                    return Ok(ChildOutcome::RestartRequested);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(ChildOutcome::Signalled),
            #[cfg(unix)]
            _ = sigterm.recv() => return Ok(ChildOutcome::Signalled),
        }
    }
}

async fn terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(%err, "failed to signal agent process to terminate");
    }
    let _ = child.wait().await;
}

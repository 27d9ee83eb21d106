use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use cw_core::config::Config;
use cw_core::events::EventBus;
use cw_daemon::lifecycle::{DaemonLifecycleManager, DaemonStatus, LifecycleError};
use cw_harness::autostart::UnsupportedAutostart;
use tracing::{debug, info};

use super::format_uptime;

const DAEMON_BIN: &str = "cronwarden-daemon";
const STARTUP_WAIT: Duration = Duration::from_secs(5);
const STARTUP_POLL: Duration = Duration::from_millis(100);

fn lifecycle(config: &Config) -> DaemonLifecycleManager {
    DaemonLifecycleManager::new(config, EventBus::new())
}

/// The daemon binary installed next to `cw`, else whatever is on `PATH`.
fn daemon_binary() -> PathBuf {
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(format!("{DAEMON_BIN}{}", std::env::consts::EXE_SUFFIX))));
    match sibling {
        Some(path) if path.exists() => path,
        _ => PathBuf::from(DAEMON_BIN),
    }
}

pub fn status(config: &Config) -> anyhow::Result<()> {
    match lifecycle(config).status()? {
        DaemonStatus::Running { pid, uptime } => {
            let uptime = uptime.map(format_uptime).unwrap_or_else(|| "unknown".to_string());
            println!("cronwarden daemon running (pid {pid}, up {uptime})");
        }
        DaemonStatus::Stopped => println!("cronwarden daemon stopped"),
        DaemonStatus::Stale { pid } => {
            println!("cronwarden daemon not running (stale record for pid {pid})");
        }
    }
    Ok(())
}

pub async fn start(config: &Config, foreground: bool) -> anyhow::Result<()> {
    let lifecycle = lifecycle(config);
    if let DaemonStatus::Running { pid, .. } = lifecycle.status()? {
        bail!("daemon already running (pid {pid})");
    }

    let bin = daemon_binary();
    debug!(bin = %bin.display(), foreground, "launching daemon");

    if foreground {
        let status = tokio::process::Command::new(&bin)
            .status()
            .await
            .with_context(|| format!("failed to run {}", bin.display()))?;
        if !status.success() {
            bail!("daemon exited with {status}");
        }
        return Ok(());
    }

    let mut command = std::process::Command::new(&bin);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Leave the terminal's process group so ctrl-c in the shell does not
        // reach the daemon.
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", bin.display()))?;

    let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
    loop {
        if let DaemonStatus::Running { pid, .. } = lifecycle.status()? {
            info!(pid, "daemon started");
            println!("cronwarden daemon started (pid {pid})");
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            bail!(
                "daemon exited during startup ({status}); see {}",
                config.log_dir().display()
            );
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "daemon (pid {}) did not report running within {STARTUP_WAIT:?}",
                child.id()
            );
        }
        tokio::time::sleep(STARTUP_POLL).await;
    }
}

pub async fn stop(config: &Config) -> anyhow::Result<()> {
    match lifecycle(config).stop().await {
        Ok(pid) => println!("cronwarden daemon stopped (pid {pid})"),
        Err(LifecycleError::NotRunning) => println!("cronwarden daemon is not running"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

pub fn install(config: &Config) -> anyhow::Result<()> {
    let outcome = lifecycle(config)
        .install(&UnsupportedAutostart)
        .context("autostart registration failed")?;
    println!("autostart installed ({})", outcome.method_used);
    Ok(())
}

//! cronwarden daemon: recovers the schedule, then runs the scheduler loop
//! until SIGTERM or ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use cw_core::config::Config;
use cw_daemon::daemon::Daemon;
use cw_daemon::lifecycle::DaemonLifecycleManager;
use cw_harness::shutdown::ShutdownSignal;
use tokio::sync::Notify;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    std::fs::create_dir_all(config.state_dir())
        .with_context(|| format!("failed to create {}", config.state_dir().display()))?;

    let _log_guard = cw_telemetry::logging::init_daemon_logging(
        &config.log_dir(),
        "cronwarden",
        &config.logging.level,
        config.logging.json,
    );
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        state_dir = %config.state_dir().display(),
        "cronwarden daemon starting"
    );

    let daemon = Daemon::new(config.clone());
    let mut lifecycle = DaemonLifecycleManager::new(&config, daemon.event_bus().clone());
    let (registry, recovery) = lifecycle.start().context("daemon start refused")?;
    if let Some(pid) = recovery.stale_pid {
        warn!(pid, "previous daemon exited without cleanup");
    }

    let scheduler = daemon.scheduler(registry);
    spawn_signal_handlers(daemon.shutdown_handle(), scheduler.wake_handle())?;

    let report = daemon.run(scheduler).await;
    if !report.orphaned.is_empty() {
        warn!(orphaned = ?report.orphaned, "exiting with executions still running");
    }

    lifecycle
        .shutdown_complete()
        .context("failed to clear daemon record")?;
    info!("cronwarden daemon stopped");
    Ok(())
}

/// SIGTERM and ctrl-c stop the daemon; SIGHUP makes the loop rescan the
/// registry after an external change.
#[cfg(unix)]
fn spawn_signal_handlers(shutdown: ShutdownSignal, wake: Arc<Notify>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = terminate.recv() => {
                    info!("SIGTERM received");
                    shutdown.trigger();
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("ctrl-c received");
                    shutdown.trigger();
                    break;
                }
                _ = hangup.recv() => {
                    info!("SIGHUP received, rescanning registry");
                    wake.notify_one();
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handlers(shutdown: ShutdownSignal, _wake: Arc<Notify>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            shutdown.trigger();
        }
    });
    Ok(())
}

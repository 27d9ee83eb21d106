use std::path::Path;

use cw_core::config::Config;
use cw_core::events::EventBus;
use cw_core::lockfile::DaemonLockfile;
use cw_core::registry::{RegistryError, TaskRegistry};
use cw_core::types::{now_epoch_secs, DaemonRecord};
use cw_daemon::lifecycle::{DaemonLifecycleManager, DaemonStatus, LifecycleError, LifecycleState};
use cw_harness::autostart::{AutostartCapability, InstallMethod, StaticAutostart, UnsupportedAutostart};

/// A pid that is never alive on a test machine.
const DEAD_PID: u32 = 4_000_000;

fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.paths.state_dir = dir.display().to_string();
    config.daemon.stop_timeout_secs = 5;
    config
}

fn manager(config: &Config) -> DaemonLifecycleManager {
    DaemonLifecycleManager::new(config, EventBus::new())
}

fn record_pid(config: &Config, pid: u32) {
    TaskRegistry::open(config.registry_path())
        .unwrap()
        .set_daemon_record(Some(DaemonRecord {
            pid,
            start_time: Some(now_epoch_secs()),
        }))
        .unwrap();
}

#[test]
fn second_start_fails_while_first_is_running() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let mut first = manager(&config);
    first.start().unwrap();
    assert_eq!(first.state(), LifecycleState::Running);

    let mut second = manager(&config);
    let err = second.start().unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyRunning { pid } if pid == std::process::id()));
    assert_eq!(second.state(), LifecycleState::NotRunning);
}

#[test]
fn stale_pid_reports_stale_then_start_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    record_pid(&config, DEAD_PID);

    let mut lifecycle = manager(&config);
    assert_eq!(lifecycle.status().unwrap(), DaemonStatus::Stale { pid: DEAD_PID });

    let (registry, report) = lifecycle.start().unwrap();
    assert_eq!(report.stale_pid, Some(DEAD_PID));
    assert_eq!(registry.daemon_record().unwrap().pid, std::process::id());
    assert!(matches!(
        lifecycle.status().unwrap(),
        DaemonStatus::Running { pid, uptime: Some(_) } if pid == std::process::id()
    ));
}

#[test]
fn crash_recovery_moves_missed_runs_forward_without_executing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let instructions = dir.path().join("nightly.md");
    std::fs::write(&instructions, "do the thing").unwrap();

    let three_days_ago = now_epoch_secs() - 3 * 86_400;
    let task = TaskRegistry::open(config.registry_path())
        .unwrap()
        .add_at("0 9 * * *", &instructions.display().to_string(), three_days_ago)
        .unwrap();
    assert!(task.next_run.unwrap() < now_epoch_secs());

    let mut lifecycle = manager(&config);
    let before = now_epoch_secs();
    let (registry, report) = lifecycle.start().unwrap();

    let recovered = registry.get(&task.id).unwrap();
    assert!(recovered.next_run.unwrap() > before);
    assert_eq!(recovered.last_run, None);
    assert_eq!(recovered.consecutive_failures, 0);
    assert_eq!(report.rescheduled, vec![task.id]);
    assert!(report.missing_instructions.is_empty());
}

#[test]
fn missing_instructions_are_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let task = TaskRegistry::open(config.registry_path())
        .unwrap()
        .add("0 9 * * *", "/definitely/not/here.md")
        .unwrap();

    let (_, report) = manager(&config).start().unwrap();
    assert_eq!(report.missing_instructions, vec![task.id]);
}

#[test]
fn corrupt_registry_refuses_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::write(config.registry_path(), "{\"tasks\": [").unwrap();

    let mut lifecycle = manager(&config);
    let err = lifecycle.start().unwrap_err();

    assert!(matches!(
        err,
        LifecycleError::Registry(RegistryError::CorruptState { .. })
    ));
    assert_eq!(lifecycle.state(), LifecycleState::NotRunning);
    assert_eq!(
        std::fs::read_to_string(config.registry_path()).unwrap(),
        "{\"tasks\": ["
    );
    assert!(!config.lockfile_path().exists());
}

#[tokio::test]
async fn stop_without_daemon_is_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let err = manager(&config).stop().await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotRunning));
}

#[tokio::test]
async fn stop_with_stale_record_clears_it() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    record_pid(&config, DEAD_PID);

    let mut lifecycle = manager(&config);
    assert!(matches!(lifecycle.stop().await, Err(LifecycleError::NotRunning)));
    assert_eq!(lifecycle.status().unwrap(), DaemonStatus::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn stop_terminates_live_daemon_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    // Reap the child so it does not linger as a zombie after SIGTERM.
    let reaper = std::thread::spawn(move || child.wait());
    record_pid(&config, pid);

    let mut lifecycle = manager(&config);
    assert_eq!(lifecycle.stop().await.unwrap(), pid);
    assert_eq!(lifecycle.state(), LifecycleState::NotRunning);
    assert_eq!(lifecycle.status().unwrap(), DaemonStatus::Stopped);
    assert!(reaper.join().unwrap().is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn stop_gives_up_on_daemon_ignoring_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.daemon.stop_timeout_secs = 1;

    let mut child = std::process::Command::new("sh")
        .args(["-c", "trap '' TERM; sleep 30"])
        .spawn()
        .unwrap();
    let pid = child.id();
    // Give the shell time to install its trap.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    record_pid(&config, pid);

    let mut lifecycle = manager(&config);
    let err = lifecycle.stop().await.unwrap_err();
    assert!(matches!(err, LifecycleError::StopTimeout { pid: p, .. } if p == pid));
    assert!(matches!(
        lifecycle.status().unwrap(),
        DaemonStatus::Running { pid: p, .. } if p == pid
    ));

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn shutdown_complete_clears_record_and_lockfile() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let mut lifecycle = manager(&config);
    lifecycle.start().unwrap();
    assert!(DaemonLockfile::read(&config.lockfile_path()).is_some());

    lifecycle.shutdown_complete().unwrap();

    assert_eq!(lifecycle.status().unwrap(), DaemonStatus::Stopped);
    assert!(!config.lockfile_path().exists());
    assert_eq!(lifecycle.state(), LifecycleState::NotRunning);
}

#[test]
fn install_reports_method_or_failure() {
    let dir = tempfile::tempdir().unwrap();
    let lifecycle = manager(&config_in(dir.path()));

    let err = lifecycle.install(&UnsupportedAutostart).unwrap_err();
    assert!(matches!(err, LifecycleError::InstallFailed(_)));

    let fallback_only = StaticAutostart {
        capability: AutostartCapability {
            primary_available: false,
            fallback_available: true,
        },
        fail_with: None,
    };
    let outcome = lifecycle.install(&fallback_only).unwrap();
    assert_eq!(outcome.method_used, InstallMethod::Fallback);
}

#[test]
fn status_without_record_is_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let lifecycle = manager(&config_in(dir.path()));
    assert_eq!(lifecycle.status().unwrap(), DaemonStatus::Stopped);
}

#[test]
fn notify_reload_is_quiet_without_a_live_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    assert_eq!(manager(&config).notify_reload().unwrap(), None);

    record_pid(&config, DEAD_PID);
    assert_eq!(manager(&config).notify_reload().unwrap(), None);
}

#[derive(Clone, Default)]
struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn startup_logs_carry_operation_trace() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        manager(&config).start().unwrap();
    });

    let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    let started = text
        .lines()
        .find(|line| line.contains("daemon started"))
        .expect("startup line logged");
    assert!(started.contains("operation=daemon_start"), "{started}");
    assert!(started.contains("trace_id="), "{started}");
}

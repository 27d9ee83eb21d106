//! Daemon start/stop/status and startup crash recovery.
//!
//! The registry's daemon record (`daemon_pid`) is the authority on which
//! process owns the schedule; `daemon.lock` is a best-effort second guard.
//! Liveness is checked with `kill(pid, 0)`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cw_core::config::Config;
use cw_core::cron::next_run_after;
use cw_core::events::{EventBus, SchedulerEvent};
use cw_core::lockfile::{pid_alive, DaemonLockfile, LockError};
use cw_core::registry::{RegistryError, TaskRegistry};
use cw_core::types::{now_epoch_secs, DaemonRecord, RegistryDocument};
use cw_harness::autostart::{Autostart, InstallError, InstallOutcome};
use cw_telemetry::tracing_setup::create_operation_span;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotRunning,
    Starting,
    Running,
    Stopping,
}

/// Read-only view of the persisted daemon record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: u32, uptime: Option<Duration> },
    Stopped,
    /// A pid is recorded but no such process is alive.
    Stale { pid: u32 },
}

/// What crash recovery changed at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tasks whose missed `next_run` was moved past startup time.
    pub rescheduled: Vec<String>,
    /// Tasks whose instructions reference does not resolve.
    pub missing_instructions: Vec<String>,
    /// Pid of a dead daemon whose record was cleared.
    pub stale_pid: Option<u32>,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("daemon already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("daemon is not running")]
    NotRunning,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    InstallFailed(#[from] InstallError),
    #[error("failed to signal daemon (pid {pid}): {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("daemon (pid {pid}) did not exit within {waited:?}")]
    StopTimeout { pid: u32, waited: Duration },
}

pub struct DaemonLifecycleManager {
    registry_path: PathBuf,
    lockfile_path: PathBuf,
    stop_timeout: Duration,
    events: EventBus,
    state: LifecycleState,
    pid: u32,
}

impl DaemonLifecycleManager {
    pub fn new(config: &Config, events: EventBus) -> Self {
        Self {
            registry_path: config.registry_path(),
            lockfile_path: config.lockfile_path(),
            stop_timeout: Duration::from_secs(config.daemon.stop_timeout_secs),
            events,
            state: LifecycleState::NotRunning,
            pid: std::process::id(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Claim the daemon record for this process and run crash recovery.
    ///
    /// Returns the loaded registry for the scheduler loop to take over.
    pub fn start(&mut self) -> Result<(TaskRegistry, RecoveryReport), LifecycleError> {
        self.start_at(now_epoch_secs())
    }

    pub fn start_at(&mut self, now: i64) -> Result<(TaskRegistry, RecoveryReport), LifecycleError> {
        self.state = LifecycleState::Starting;
        let (span, trace_id) = create_operation_span("daemon_start");
        let _entered = span.enter();
        debug!(%trace_id, pid = self.pid, "claiming daemon record and recovering schedule");
        let started = self.claim_and_recover(now);
        match &started {
            Ok((registry, report)) => {
                self.state = LifecycleState::Running;
                info!(
                    pid = self.pid,
                    tasks = registry.list().len(),
                    rescheduled = report.rescheduled.len(),
                    "daemon started"
                );
                self.events.publish(SchedulerEvent::DaemonStarted { pid: self.pid });
            }
            Err(e) => {
                self.state = LifecycleState::NotRunning;
                error!(error = %e, "daemon start refused");
            }
        }
        started
    }

    fn claim_and_recover(
        &mut self,
        now: i64,
    ) -> Result<(TaskRegistry, RecoveryReport), LifecycleError> {
        // CorruptState stops startup here.
        let mut registry = TaskRegistry::open(&self.registry_path)?;

        let mut stale_pid = None;
        if let Some(record) = registry.daemon_record() {
            if pid_alive(record.pid) {
                return Err(LifecycleError::AlreadyRunning { pid: record.pid });
            }
            warn!(pid = record.pid, "clearing stale daemon record");
            stale_pid = Some(record.pid);
        }

        match DaemonLockfile::for_current_process(now).acquire_or_fail(&self.lockfile_path) {
            Ok(()) => {}
            Err(LockError::AlreadyRunning(existing)) if existing.pid != self.pid => {
                return Err(LifecycleError::AlreadyRunning { pid: existing.pid });
            }
            Err(LockError::AlreadyRunning(_)) => {}
            Err(e) => warn!(error = %e, "daemon lockfile unavailable, continuing without it"),
        }

        let pid = self.pid;
        let events = self.events.clone();
        let recovered = registry.transaction(|doc| {
            let mut report = recover(doc, now, &events);
            report.stale_pid = stale_pid;
            doc.set_daemon_record(Some(DaemonRecord {
                pid,
                start_time: Some(now),
            }));
            Ok(report)
        });

        match recovered {
            Ok(report) => Ok((registry, report)),
            Err(e) => {
                DaemonLockfile::release(&self.lockfile_path, self.pid);
                Err(e.into())
            }
        }
    }

    /// Ask the running daemon to stop and wait for it to exit.
    pub async fn stop(&mut self) -> Result<u32, LifecycleError> {
        let mut registry = TaskRegistry::open(&self.registry_path)?;
        let pid = registry
            .daemon_record()
            .map(|r| r.pid)
            .or_else(|| DaemonLockfile::read(&self.lockfile_path).map(|l| l.pid));

        let Some(pid) = pid.filter(|pid| pid_alive(*pid)) else {
            // Tidy up whatever a crashed daemon left behind.
            clear_record(&mut registry, pid)?;
            if let Some(pid) = pid {
                DaemonLockfile::release(&self.lockfile_path, pid);
            }
            return Err(LifecycleError::NotRunning);
        };

        self.state = LifecycleState::Stopping;
        self.events.publish(SchedulerEvent::DaemonStopping { pid });
        info!(pid, "sending stop signal to daemon");
        send_terminate(pid)?;

        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        while pid_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                self.state = LifecycleState::NotRunning;
                return Err(LifecycleError::StopTimeout {
                    pid,
                    waited: self.stop_timeout,
                });
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        clear_record(&mut registry, Some(pid))?;
        DaemonLockfile::release(&self.lockfile_path, pid);
        self.state = LifecycleState::NotRunning;
        info!(pid, "daemon stopped");
        Ok(pid)
    }

    /// Called by the daemon itself on the way out.
    pub fn shutdown_complete(&mut self) -> Result<(), LifecycleError> {
        let mut registry = TaskRegistry::open(&self.registry_path)?;
        clear_record(&mut registry, Some(self.pid))?;
        DaemonLockfile::release(&self.lockfile_path, self.pid);
        self.state = LifecycleState::NotRunning;
        info!(pid = self.pid, "daemon record cleared");
        Ok(())
    }

    pub fn status(&self) -> Result<DaemonStatus, LifecycleError> {
        let registry = TaskRegistry::open(&self.registry_path)?;
        Ok(match registry.daemon_record() {
            None => DaemonStatus::Stopped,
            Some(record) if pid_alive(record.pid) => DaemonStatus::Running {
                pid: record.pid,
                uptime: record
                    .start_time
                    .map(|start| Duration::from_secs(now_epoch_secs().saturating_sub(start).max(0) as u64)),
            },
            Some(record) => DaemonStatus::Stale { pid: record.pid },
        })
    }

    /// Nudge a running daemon to rescan the registry after a CLI change.
    ///
    /// Returns the pid that was signalled, or `None` when no daemon is up.
    /// The daemon also rescans on its own timer, so a missing daemon is fine.
    pub fn notify_reload(&self) -> Result<Option<u32>, LifecycleError> {
        match self.status()? {
            DaemonStatus::Running { pid, .. } if pid != self.pid => {
                send_hangup(pid)?;
                info!(pid, "asked daemon to rescan registry");
                Ok(Some(pid))
            }
            _ => Ok(None),
        }
    }

    /// Register autostart on explicit request only.
    pub fn install(&self, autostart: &dyn Autostart) -> Result<InstallOutcome, LifecycleError> {
        let capability = autostart.query_capability();
        info!(
            primary = capability.primary_available,
            fallback = capability.fallback_available,
            "installing autostart"
        );
        match autostart.install() {
            Ok(outcome) => {
                info!(method = %outcome.method_used, "autostart installed");
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "autostart install failed");
                Err(e.into())
            }
        }
    }
}

/// Move missed firings past `now` and report unresolvable instructions.
///
/// Missed firings are never replayed.
pub fn recover(doc: &mut RegistryDocument, now: i64, events: &EventBus) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    for task in doc.tasks.iter_mut() {
        if !Path::new(&task.instructions_reference).exists() {
            warn!(
                task_id = %task.id,
                reference = %task.instructions_reference,
                "instructions reference does not resolve"
            );
            events.publish(SchedulerEvent::InstructionsMissing {
                task_id: task.id.clone(),
                reference: task.instructions_reference.clone(),
            });
            report.missing_instructions.push(task.id.clone());
        }

        if !task.enabled || task.next_run.is_some_and(|next| next > now) {
            continue;
        }

        match next_run_after(&task.cron_expression, now) {
            Ok(next) => {
                let missed = task.next_run.unwrap_or(now);
                info!(task_id = %task.id, missed, next_run = next, "rescheduled missed firing");
                events.publish(SchedulerEvent::NextRunRecovered {
                    task_id: task.id.clone(),
                    missed,
                    next_run: next,
                });
                task.next_run = Some(next);
                report.rescheduled.push(task.id.clone());
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "cannot reschedule task"),
        }
    }
    report
}

/// Clear the daemon record if it still names `pid` (or any pid when `None`).
fn clear_record(registry: &mut TaskRegistry, pid: Option<u32>) -> Result<(), RegistryError> {
    if registry.daemon_record().is_none() {
        return Ok(());
    }
    registry.transaction(|doc| {
        let owned = match (doc.daemon_pid, pid) {
            (Some(recorded), Some(pid)) => recorded == pid,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if owned {
            doc.set_daemon_record(None);
        }
        Ok(())
    })
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> Result<(), LifecycleError> {
    send_signal(pid, libc::SIGTERM)
}

#[cfg(unix)]
fn send_hangup(pid: u32) -> Result<(), LifecycleError> {
    send_signal(pid, libc::SIGHUP)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), LifecycleError> {
    let raw = i32::try_from(pid).map_err(|_| LifecycleError::NotRunning)?;
    // SAFETY: plain kill(2) on a pid we just confirmed is alive.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(LifecycleError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) -> Result<(), LifecycleError> {
    Err(LifecycleError::Signal {
        pid,
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "signals need unix"),
    })
}

#[cfg(not(unix))]
fn send_hangup(_pid: u32) -> Result<(), LifecycleError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_core::types::Task;

    #[test]
    fn recover_only_touches_missed_enabled_tasks() {
        let events = EventBus::new();
        let rx = events.subscribe();
        let mut doc = RegistryDocument::default();

        let mut missed = Task::new("missed", "0 * * * *", "/nope/missed.md", 0);
        missed.next_run = Some(3_600);
        let mut future = Task::new("future", "0 * * * *", "/nope/future.md", 0);
        future.next_run = Some(100_000);
        let mut disabled = Task::new("disabled", "0 * * * *", "/nope/disabled.md", 0);
        disabled.next_run = Some(3_600);
        disabled.enabled = false;
        doc.tasks = vec![missed, future, disabled];

        let report = recover(&mut doc, 10_000, &events);

        assert_eq!(report.rescheduled, vec!["missed".to_string()]);
        assert_eq!(doc.tasks[0].next_run, Some(10_800));
        assert_eq!(doc.tasks[1].next_run, Some(100_000));
        assert_eq!(doc.tasks[2].next_run, Some(3_600));
        assert_eq!(report.missing_instructions.len(), 3);
        assert!(rx.try_iter().any(|e| matches!(e, SchedulerEvent::NextRunRecovered { .. })));
    }

    #[test]
    fn clear_record_respects_owner() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = TaskRegistry::open(dir.path().join("tasks.json")).unwrap();
        registry
            .set_daemon_record(Some(DaemonRecord {
                pid: 10,
                start_time: None,
            }))
            .unwrap();

        clear_record(&mut registry, Some(11)).unwrap();
        assert_eq!(registry.daemon_record().unwrap().pid, 10);
        clear_record(&mut registry, Some(10)).unwrap();
        assert!(registry.daemon_record().is_none());
    }
}

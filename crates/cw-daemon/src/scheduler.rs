//! The daemon's control loop.
//!
//! Each wake cycle refreshes the registry from disk, dispatches every due
//! task as an independent tokio task, then sleeps until the soonest
//! `next_run` (capped at the configured maximum wait). Executions never block
//! the loop; their outcomes are written back to the registry as they finish.
//!
//! There is no cap on concurrent executions. A burst of due tasks spawns one
//! execution per task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use cw_core::config::SchedulerConfig;
use cw_core::cron::next_run_after;
use cw_core::events::{EventBus, SchedulerEvent};
use cw_core::registry::{RegistryError, TaskRegistry};
use cw_core::types::{now_epoch_secs, Task};
use cw_harness::shutdown::ShutdownSignal;
use cw_telemetry::tracing_setup::execution_span;
use dashmap::DashMap;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::executor::{ExecutionResult, TaskExecutor};

/// Pause before retrying an outcome write that hit a busy registry.
const OUTCOME_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Registry handle shared between the loop and its executions.
pub type SharedRegistry = Arc<Mutex<TaskRegistry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Sleeping until the next due task or a wake signal.
    Idle,
    /// Starting executions for the current wake cycle.
    Dispatching,
    /// No further dispatch; in-flight executions are draining.
    Stopped,
}

/// What one wake cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub dispatched: Vec<String>,
    /// Due, but the previous firing was still running.
    pub skipped: Vec<String>,
    /// Soonest `next_run` among enabled tasks after this cycle.
    pub next_wake: Option<i64>,
}

/// Outcome of waiting for in-flight executions at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub orphaned: Vec<String>,
}

pub struct SchedulerLoop {
    registry: SharedRegistry,
    executor: Arc<TaskExecutor>,
    events: EventBus,
    config: SchedulerConfig,
    /// Task id -> fire time of its running execution.
    in_flight: Arc<DashMap<String, i64>>,
    executions: JoinSet<()>,
    wake: Arc<Notify>,
    cycles: Arc<AtomicU64>,
    state: SchedulerState,
}

impl SchedulerLoop {
    pub fn new(
        registry: TaskRegistry,
        executor: TaskExecutor,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
            executor: Arc::new(executor),
            events,
            config,
            in_flight: Arc::new(DashMap::new()),
            executions: JoinSet::new(),
            wake: Arc::new(Notify::new()),
            cycles: Arc::new(AtomicU64::new(0)),
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Notifying this handle makes the loop rescan the registry immediately.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Number of completed wake cycles.
    pub fn cycle_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.cycles)
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run one wake cycle at `now` (epoch seconds).
    pub fn tick(&mut self, now: i64) -> CycleReport {
        self.reap_finished();
        self.state = SchedulerState::Dispatching;

        let mut report = CycleReport::default();
        let tasks = {
            let mut registry = lock(&self.registry);
            if let Err(e) = registry.load() {
                error!(error = %e, "registry refresh failed, using last snapshot");
            }
            registry.list()
        };

        for task in tasks.iter().filter(|t| t.is_due(now)) {
            if self.in_flight.contains_key(&task.id) {
                self.skip(task, now);
                report.skipped.push(task.id.clone());
            } else if self.dispatch(task, now) {
                report.dispatched.push(task.id.clone());
            }
        }

        report.next_wake = lock(&self.registry)
            .list()
            .iter()
            .filter(|t| t.enabled)
            .filter_map(|t| t.next_run)
            .min();

        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.state = SchedulerState::Idle;
        if !report.dispatched.is_empty() || !report.skipped.is_empty() {
            info!(
                dispatched = report.dispatched.len(),
                skipped = report.skipped.len(),
                next_wake = ?report.next_wake,
                "wake cycle complete"
            );
        }
        report
    }

    /// Loop until `shutdown` fires, then drain in-flight executions.
    pub async fn run(mut self, shutdown: ShutdownSignal) -> DrainReport {
        info!(max_wait_secs = self.config.max_wait_secs, "scheduler loop started");

        while !shutdown.is_shutting_down() {
            // Registry I/O can wait on another writer's guard file.
            let report = blocking_io(|| self.tick(now_epoch_secs()));
            let sleep_for = self.sleep_duration(report.next_wake);
            debug!(sleep_ms = sleep_for.as_millis() as u64, "scheduler idle");

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {
                    debug!("scheduler woken early");
                }
                _ = shutdown.wait() => {}
            }
        }

        info!("stop requested, no further dispatch");
        self.state = SchedulerState::Stopped;
        self.drain(self.config.shutdown_grace()).await
    }

    /// Wait up to `grace` for in-flight executions, then abandon the rest.
    pub async fn drain(&mut self, grace: Duration) -> DrainReport {
        self.state = SchedulerState::Stopped;
        let mut report = DrainReport::default();

        let waited = tokio::time::timeout(grace, async {
            let mut completed = 0;
            while let Some(joined) = self.executions.join_next().await {
                log_join_error(joined);
                completed += 1;
            }
            completed
        })
        .await;

        match waited {
            Ok(completed) => report.completed = completed,
            Err(_) => {
                for entry in self.in_flight.iter() {
                    warn!(task_id = %entry.key(), fired_at = *entry.value(), "execution orphaned at shutdown");
                    self.events.publish(SchedulerEvent::ExecutionOrphaned {
                        task_id: entry.key().clone(),
                    });
                    report.orphaned.push(entry.key().clone());
                }
                self.executions.detach_all();
            }
        }
        report
    }

    /// Wait for every in-flight execution to finish.
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.executions.join_next().await {
            log_join_error(joined);
        }
    }

    fn sleep_duration(&self, next_wake: Option<i64>) -> Duration {
        sleep_until(next_wake, Utc::now().timestamp_millis(), self.config.max_wait())
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.executions.try_join_next() {
            log_join_error(joined);
        }
    }

    /// A firing came due while the previous one is still running: advance
    /// `next_run` without touching the failure counter.
    fn skip(&self, task: &Task, now: i64) {
        warn!(task_id = %task.id, "previous execution still running, skipping firing");
        self.events.publish(SchedulerEvent::TaskSkipped {
            task_id: task.id.clone(),
        });

        let next = next_run_after(&task.cron_expression, now).ok();
        if let Err(e) = lock(&self.registry).update(&task.id, |t| t.next_run = next) {
            error!(task_id = %task.id, error = %e, "failed to advance skipped task");
        }
    }

    /// Advance the schedule and spawn the execution. Returns `false` when the
    /// task could not be claimed.
    fn dispatch(&mut self, task: &Task, now: i64) -> bool {
        let next = match next_run_after(&task.cron_expression, now) {
            Ok(next) => Some(next),
            Err(e) => {
                error!(task_id = %task.id, error = %e, "no future firing, task will not be rescheduled");
                None
            }
        };

        // Persist the new schedule before running so a crash mid-execution
        // never replays this firing.
        let claimed = lock(&self.registry).update(&task.id, |t| {
            t.last_run = Some(now);
            t.next_run = next;
        });
        let task = match claimed {
            Ok(task) => task,
            Err(RegistryError::NotFound(_)) => {
                debug!(task_id = %task.id, "task removed before dispatch");
                return false;
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to claim due task");
                return false;
            }
        };

        info!(task_id = %task.id, fired_at = now, next_run = ?next, "dispatching task");
        self.events.publish(SchedulerEvent::TaskDispatched {
            task_id: task.id.clone(),
            fired_at: now,
        });
        let claim = InFlightClaim::new(Arc::clone(&self.in_flight), &task.id, now);

        let span = execution_span(&task.id);
        let execution = Execution {
            executor: Arc::clone(&self.executor),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            failure_threshold: self.config.failure_threshold,
            _claim: claim,
        };
        self.executions.spawn(execution.run(task).instrument(span));
        true
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Marks a task as running; the mark is dropped with the execution, even
/// when it panics or is aborted.
struct InFlightClaim {
    in_flight: Arc<DashMap<String, i64>>,
    task_id: String,
}

impl InFlightClaim {
    fn new(in_flight: Arc<DashMap<String, i64>>, task_id: &str, fired_at: i64) -> Self {
        in_flight.insert(task_id.to_string(), fired_at);
        Self {
            in_flight,
            task_id: task_id.to_string(),
        }
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.in_flight.remove(&self.task_id);
    }
}

/// Everything a spawned execution needs to record its outcome.
struct Execution {
    executor: Arc<TaskExecutor>,
    registry: SharedRegistry,
    events: EventBus,
    failure_threshold: u32,
    _claim: InFlightClaim,
}

impl Execution {
    async fn run(self, task: Task) {
        let started = Instant::now();
        let executor = Arc::clone(&self.executor);
        let firing = task.clone();
        // A panicking runner fails this firing instead of taking the
        // bookkeeping below down with it.
        let inner = tokio::spawn(async move { executor.execute(&firing).await }.in_current_span());
        let result = match inner.await {
            Ok(result) => result,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "execution aborted, counting as failed firing");
                ExecutionResult {
                    success: false,
                    duration: started.elapsed(),
                    log_path: None,
                    attempts: 1,
                    exit_status: None,
                }
            }
        };

        let registry = Arc::clone(&self.registry);
        let task_id = task.id.clone();
        let threshold = self.failure_threshold;
        let success = result.success;
        let recorded = tokio::task::spawn_blocking(move || {
            record_outcome(&registry, &task_id, success, threshold)
        })
        .await;

        match recorded {
            Ok(Ok((updated, disabled))) => self.publish_outcome(&updated, &result, disabled),
            Ok(Err(RegistryError::NotFound(_))) => {
                debug!(task_id = %task.id, "task removed while executing");
            }
            Ok(Err(e)) => {
                error!(task_id = %task.id, success, error = %e, "failed to record outcome");
                self.events.publish(SchedulerEvent::OutcomeNotRecorded {
                    task_id: task.id.clone(),
                    success,
                });
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "outcome recorder panicked");
                self.events.publish(SchedulerEvent::OutcomeNotRecorded {
                    task_id: task.id.clone(),
                    success,
                });
            }
        }
    }

    fn publish_outcome(&self, task: &Task, result: &ExecutionResult, disabled: bool) {
        if result.success {
            info!(
                task_id = %task.id,
                attempts = result.attempts,
                duration_ms = result.duration.as_millis() as u64,
                "firing succeeded"
            );
            self.events.publish(SchedulerEvent::TaskSucceeded {
                task_id: task.id.clone(),
                attempts: result.attempts,
            });
            return;
        }

        warn!(
            task_id = %task.id,
            attempts = result.attempts,
            consecutive_failures = task.consecutive_failures,
            log = ?result.log_path,
            "firing failed"
        );
        self.events.publish(SchedulerEvent::TaskFailed {
            task_id: task.id.clone(),
            attempts: result.attempts,
            consecutive_failures: task.consecutive_failures,
        });

        if disabled {
            warn!(
                task_id = %task.id,
                consecutive_failures = task.consecutive_failures,
                "task disabled after repeated failures"
            );
            self.events.publish(SchedulerEvent::TaskDisabled {
                task_id: task.id.clone(),
                consecutive_failures: task.consecutive_failures,
            });
        }
    }
}

/// Write one firing's outcome back, retrying once if the registry was busy.
///
/// Returns the updated task and whether this failure disabled it.
fn record_outcome(
    registry: &SharedRegistry,
    task_id: &str,
    success: bool,
    threshold: u32,
) -> Result<(Task, bool), RegistryError> {
    let attempt = || {
        let mut disabled = false;
        let updated = lock(registry).update(task_id, |t| {
            if success {
                t.record_success();
            } else {
                disabled = t.record_failure(now_epoch_secs(), threshold);
            }
        });
        updated.map(|t| (t, disabled))
    };

    match attempt() {
        Err(RegistryError::NotFound(id)) => Err(RegistryError::NotFound(id)),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "recording outcome failed, retrying once");
            std::thread::sleep(OUTCOME_RETRY_DELAY);
            attempt()
        }
        ok => ok,
    }
}

/// How long to sleep before the next wake given the soonest `next_run`.
///
/// Millisecond precision so the loop never wakes just before a due second;
/// a wake time already in the past means "due now".
fn sleep_until(next_wake: Option<i64>, now_ms: i64, max_wait: Duration) -> Duration {
    match next_wake {
        Some(next) => {
            let remaining_ms = next.saturating_mul(1000).saturating_sub(now_ms);
            Duration::from_millis(remaining_ms.max(0) as u64).min(max_wait)
        }
        None => max_wait,
    }
}

/// Run blocking registry work without stalling a multi-threaded runtime's
/// worker. Single-threaded runtimes (tests) run it inline.
fn blocking_io<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn lock(registry: &SharedRegistry) -> std::sync::MutexGuard<'_, TaskRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "execution task aborted");
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use cw_core::types::Task;
use cw_harness::agent::AgentRunner;
use cw_harness::retry::{FailureTracker, RetryDecision};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Terminal outcome of one firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub duration: Duration,
    /// Per-execution log artifact; `None` if it could not be created.
    pub log_path: Option<PathBuf>,
    /// Attempts made, including the initial one.
    pub attempts: u32,
    /// Exit status of the final attempt, if it ran to completion.
    pub exit_status: Option<i32>,
}

/// Runs one firing of a task to completion, retrying per the
/// [`FailureTracker`] policy.
///
/// Retry sleeps suspend only the calling task, so executions spawned by the
/// scheduler never hold up its timer.
pub struct TaskExecutor {
    agent: Arc<dyn AgentRunner>,
    tracker: FailureTracker,
    executions_dir: PathBuf,
}

impl TaskExecutor {
    pub fn new(
        agent: Arc<dyn AgentRunner>,
        tracker: FailureTracker,
        executions_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent,
            tracker,
            executions_dir: executions_dir.into(),
        }
    }

    pub fn executions_dir(&self) -> &Path {
        &self.executions_dir
    }

    /// Execute `task` once. Agent failures are captured in the result.
    pub async fn execute(&self, task: &Task) -> ExecutionResult {
        let started = Instant::now();
        let mut log = ExecutionLog::create(&self.executions_dir, &task.id).await;
        let mut failures = 0u32;

        loop {
            let attempt = failures + 1;
            log.line(&format!(
                "=== attempt {attempt} started {} ({}) ===",
                Utc::now().to_rfc3339(),
                self.agent.name()
            ))
            .await;

            let exit_status = match self.agent.run(&task.instructions_reference).await {
                Ok(out) => {
                    log.raw(&out.output).await;
                    log.line(&format!("=== attempt {attempt} exited {:?} ===", out.exit_status))
                        .await;
                    if out.success() {
                        info!(task_id = %task.id, attempt, "execution succeeded");
                        return self.finish(started, log, attempt, true, out.exit_status).await;
                    }
                    out.exit_status
                }
                Err(e) => {
                    log.line(&format!("=== attempt {attempt} failed: {e} ===")).await;
                    None
                }
            };

            failures += 1;
            match self.tracker.decide(failures) {
                RetryDecision::Retry { after } => {
                    warn!(
                        task_id = %task.id,
                        attempt,
                        exit_status = ?exit_status,
                        retry_in_ms = after.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(after).await;
                }
                RetryDecision::GiveUp => {
                    warn!(task_id = %task.id, attempts = attempt, "giving up on firing");
                    return self.finish(started, log, attempt, false, exit_status).await;
                }
            }
        }
    }

    async fn finish(
        &self,
        started: Instant,
        log: ExecutionLog,
        attempts: u32,
        success: bool,
        exit_status: Option<i32>,
    ) -> ExecutionResult {
        let duration = started.elapsed();
        let log_path = log.close(success, duration).await;
        ExecutionResult {
            success,
            duration,
            log_path,
            attempts,
            exit_status,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionLog
// ---------------------------------------------------------------------------

/// Append-only `<executions_dir>/<task_id>/<timestamp>.log`.
///
/// Write errors are logged once and further output is dropped.
struct ExecutionLog {
    path: PathBuf,
    file: Option<File>,
}

impl ExecutionLog {
    async fn create(executions_dir: &Path, task_id: &str) -> Self {
        let dir = executions_dir.join(task_id);
        let path = dir.join(format!("{}.log", Utc::now().format("%Y%m%dT%H%M%S%.6fZ")));

        let opened = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
            }
            Err(e) => Err(e),
        };

        let file = match opened {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot create execution log");
                None
            }
        };
        Self { path, file }
    }

    async fn raw(&mut self, text: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(text.as_bytes()).await {
            warn!(path = %self.path.display(), error = %e, "execution log write failed");
            self.file = None;
        }
    }

    async fn line(&mut self, text: &str) {
        self.raw(text).await;
        self.raw("\n").await;
    }

    async fn close(mut self, success: bool, duration: Duration) -> Option<PathBuf> {
        self.line(&format!(
            "=== finished success={success} duration_ms={} ===",
            duration.as_millis()
        ))
        .await;
        let mut file = self.file.take()?;
        if let Err(e) = file.flush().await {
            warn!(path = %self.path.display(), error = %e, "execution log flush failed");
        }
        debug!(path = %self.path.display(), "execution log closed");
        Some(self.path)
    }
}

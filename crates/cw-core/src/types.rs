use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of consecutive failed firings after which a task is disabled.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Current UTC time as epoch seconds.
pub fn now_epoch_secs() -> i64 {
    Utc::now().timestamp()
}

/// Epoch seconds to a UTC datetime, `None` when out of chrono's range.
pub fn datetime_from_epoch(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A user-defined unit of schedulable work.
///
/// All timestamps are seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub cron_expression: String,
    /// Reference (usually a file path) to the opaque instruction payload.
    pub instructions_reference: String,
    pub enabled: bool,
    pub created_at: i64,
    pub last_run: Option<i64>,
    pub next_run: Option<i64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_failure_time: Option<i64>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        cron_expression: impl Into<String>,
        instructions_reference: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            cron_expression: cron_expression.into(),
            instructions_reference: instructions_reference.into(),
            enabled: true,
            created_at,
            last_run: None,
            next_run: None,
            consecutive_failures: 0,
            last_failure_time: None,
        }
    }

    /// Enabled and `next_run` has elapsed at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.enabled && self.next_run.is_some_and(|next| next <= now)
    }

    /// A firing completed successfully: the failure streak ends.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// A firing ended in give-up. Returns `true` when this failure pushed
    /// the task over `threshold` and it was disabled.
    pub fn record_failure(&mut self, now: i64, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_time = Some(now);
        if self.enabled && self.consecutive_failures >= threshold {
            self.enabled = false;
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Daemon record
// ---------------------------------------------------------------------------

/// The single running scheduler process, as persisted in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonRecord {
    pub pid: u32,
    pub start_time: Option<i64>,
}

// ---------------------------------------------------------------------------
// RegistryDocument
// ---------------------------------------------------------------------------

/// The durable state document: every task plus the daemon record.
///
/// Serialized as `{"tasks": [...], "daemon_pid": <int|null>}`; the optional
/// `daemon_started_at` is only written while a daemon is recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDocument {
    pub tasks: Vec<Task>,
    pub daemon_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_started_at: Option<i64>,
}

impl RegistryDocument {
    pub fn daemon_record(&self) -> Option<DaemonRecord> {
        self.daemon_pid.map(|pid| DaemonRecord {
            pid,
            start_time: self.daemon_started_at,
        })
    }

    pub fn set_daemon_record(&mut self, record: Option<DaemonRecord>) {
        self.daemon_pid = record.map(|r| r.pid);
        self.daemon_started_at = record.and_then(|r| r.start_time);
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

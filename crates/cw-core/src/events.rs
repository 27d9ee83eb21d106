use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Something observable happened inside the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    DaemonStarted { pid: u32 },
    DaemonStopping { pid: u32 },
    /// Crash recovery moved a missed `next_run` forward.
    NextRunRecovered { task_id: String, missed: i64, next_run: i64 },
    /// Crash recovery could not resolve a task's instructions.
    InstructionsMissing { task_id: String, reference: String },
    TaskDispatched { task_id: String, fired_at: i64 },
    /// A firing came due while the previous one was still running.
    TaskSkipped { task_id: String },
    TaskSucceeded { task_id: String, attempts: u32 },
    TaskFailed { task_id: String, attempts: u32, consecutive_failures: u32 },
    TaskDisabled { task_id: String, consecutive_failures: u32 },
    /// A firing finished but its outcome could not be written back.
    OutcomeNotRecorded { task_id: String, success: bool },
    /// Still running when the shutdown grace period ran out.
    ExecutionOrphaned { task_id: String },
    ResourceSample {
        cpu_percent: f32,
        memory_bytes: u64,
        uptime_secs: u64,
        loop_cycles: u64,
    },
}

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](Self::subscribe) creates a new receiver that
/// gets every event published after the subscription was created. Cloning
/// the bus is cheap and clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<SchedulerEvent>>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<SchedulerEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Publish an event to all current subscribers.
    ///
    /// Disconnected subscribers are pruned.
    pub fn publish(&self, event: SchedulerEvent) {
        let mut senders = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

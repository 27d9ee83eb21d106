//! External agent collaborator.
//!
//! A task's instructions are opaque to the scheduler. Each attempt hands the
//! task's `instructions_reference` to an [`AgentRunner`], which reports the
//! exit status and the captured output. The production runner,
//! [`CommandAgent`], spawns a configured executable; [`ScriptedAgent`] plays
//! back canned outcomes for tests and dry runs.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use cw_core::config::AgentConfig;
use tracing::debug;

// ---------------------------------------------------------------------------
// Output / Error
// ---------------------------------------------------------------------------

/// Result of one agent attempt that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    /// Process exit code; `None` when terminated by a signal.
    pub exit_status: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

impl AgentOutput {
    pub fn new(exit_status: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            exit_status,
            output: output.into(),
        }
    }

    /// Only a clean zero exit counts as success.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// An attempt that could not produce an [`AgentOutput`].
///
/// Callers treat every variant as a failed attempt, the same as a non-zero
/// exit.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to start agent `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent attempt timed out after {0:?}")]
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// AgentRunner trait
// ---------------------------------------------------------------------------

/// Runs a task's instructions to completion.
///
/// Implementations must be cheap to share across concurrent executions; the
/// scheduler holds one runner behind an `Arc` for the whole daemon lifetime.
#[async_trait::async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one attempt against `instructions_reference`.
    async fn run(&self, instructions_reference: &str) -> Result<AgentOutput, AgentError>;

    /// Human-readable runner name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// CommandAgent
// ---------------------------------------------------------------------------

/// Spawns `command args... <instructions_reference>` for every attempt.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
    attempt_timeout: Option<Duration>,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            attempt_timeout: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let mut agent = Self::new(config.command.clone(), config.args.clone());
        agent.attempt_timeout = config.attempt_timeout_secs.map(Duration::from_secs);
        agent
    }

    /// Kill an attempt that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait::async_trait]
impl AgentRunner for CommandAgent {
    async fn run(&self, instructions_reference: &str) -> Result<AgentOutput, AgentError> {
        debug!(command = %self.command, reference = %instructions_reference, "spawning agent");

        let child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .arg(instructions_reference)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(self.attempt_timeout.is_some())
            .spawn()
            .map_err(|source| AgentError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        // Without a timeout the agent is never killed by the runner.
        let output = match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| AgentError::Timeout(limit))??,
            None => child.wait_with_output().await?,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        Ok(AgentOutput {
            exit_status: output.status.code(),
            output: text,
        })
    }

    fn name(&self) -> &str {
        &self.command
    }
}

// ---------------------------------------------------------------------------
// ScriptedAgent
// ---------------------------------------------------------------------------

/// One canned attempt outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Exit(i32),
    /// Behave like an agent binary that cannot be started.
    SpawnFailure,
    /// Panic inside `run`, like a buggy runner implementation.
    Panic,
}

/// Plays back a fixed sequence of outcomes, repeating the last one forever.
///
/// Every attempt can be delayed to simulate long-running work.
#[derive(Debug)]
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<ScriptStep>>,
    last: ScriptStep,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedAgent {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        let steps: VecDeque<_> = steps.into_iter().collect();
        let last = steps.back().cloned().unwrap_or(ScriptStep::Exit(0));
        Self {
            steps: Mutex::new(steps),
            last,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new([ScriptStep::Exit(0)])
    }

    pub fn failing(code: i32) -> Self {
        Self::new([ScriptStep::Exit(code)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of attempts made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptStep {
        let mut steps = self.steps.lock().unwrap_or_else(PoisonError::into_inner);
        steps.pop_front().unwrap_or_else(|| self.last.clone())
    }
}

#[async_trait::async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run(&self, instructions_reference: &str) -> Result<AgentOutput, AgentError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.next_step() {
            ScriptStep::Exit(code) => Ok(AgentOutput::new(
                Some(code),
                format!("scripted attempt {attempt} for {instructions_reference}: exit {code}\n"),
            )),
            ScriptStep::SpawnFailure => Err(AgentError::Spawn {
                command: "scripted".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such agent"),
            }),
            ScriptStep::Panic => panic!("scripted agent panicked on attempt {attempt}"),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

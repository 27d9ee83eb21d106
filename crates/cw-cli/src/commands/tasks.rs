use std::fmt::Write as _;

use anyhow::Context;
use cw_core::config::Config;
use cw_core::events::EventBus;
use cw_core::registry::TaskRegistry;
use cw_core::types::Task;
use cw_daemon::lifecycle::DaemonLifecycleManager;
use tracing::warn;

use super::format_epoch;

fn open(config: &Config) -> anyhow::Result<TaskRegistry> {
    std::fs::create_dir_all(config.state_dir())
        .with_context(|| format!("failed to create {}", config.state_dir().display()))?;
    TaskRegistry::open(config.registry_path()).context("failed to open task registry")
}

/// Wake a running daemon so it picks up the change before its next timer.
fn nudge_daemon(config: &Config) {
    let lifecycle = DaemonLifecycleManager::new(config, EventBus::new());
    if let Err(e) = lifecycle.notify_reload() {
        warn!(error = %e, "could not wake daemon; it will rescan on its own");
    }
}

/// Resolve `instructions` against the caller's cwd; the daemon runs elsewhere.
/// Paths that do not exist yet are stored as given.
fn resolve_instructions(instructions: &str) -> String {
    match std::fs::canonicalize(instructions) {
        Ok(path) => path.display().to_string(),
        Err(e) => {
            warn!(path = instructions, error = %e, "instructions not found, storing path as given");
            instructions.to_string()
        }
    }
}

pub fn add(config: &Config, cron: &str, instructions: &str) -> anyhow::Result<Task> {
    let instructions = resolve_instructions(instructions);
    let task = open(config)?
        .add(cron, &instructions)
        .with_context(|| format!("cannot add task with schedule {cron:?}"))?;
    nudge_daemon(config);
    Ok(task)
}

pub fn remove(config: &Config, id: &str) -> anyhow::Result<()> {
    open(config)?
        .remove(id)
        .with_context(|| format!("cannot remove task {id}"))?;
    nudge_daemon(config);
    Ok(())
}

pub fn list(config: &Config) -> anyhow::Result<Vec<Task>> {
    let mut tasks = open(config)?.list();
    tasks.sort_by_key(|t| (t.next_run.unwrap_or(i64::MAX), t.created_at));
    Ok(tasks)
}

pub fn render(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "no tasks registered\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<36}  {:<15}  {:<8}  {:<20}  {:>8}  INSTRUCTIONS",
        "ID", "SCHEDULE", "ENABLED", "NEXT RUN", "FAILURES"
    );
    for task in tasks {
        let _ = writeln!(
            out,
            "{:<36}  {:<15}  {:<8}  {:<20}  {:>8}  {}",
            task.id,
            task.cron_expression,
            if task.enabled { "yes" } else { "no" },
            format_epoch(task.next_run),
            task.consecutive_failures,
            task.instructions_reference,
        );
    }
    out
}

use std::sync::Arc;
use std::time::Duration;

use cw_core::config::Config;
use cw_core::events::SchedulerEvent;
use cw_core::registry::TaskRegistry;
use cw_core::types::now_epoch_secs;
use cw_daemon::daemon::Daemon;
use cw_daemon::lifecycle::{DaemonLifecycleManager, DaemonStatus};
use cw_harness::agent::ScriptedAgent;

#[tokio::test]
async fn daemon_runs_task_added_after_start_and_shuts_down_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.paths.state_dir = dir.path().display().to_string();
    config.retry.base_delay_ms = 1;

    let agent = Arc::new(ScriptedAgent::succeeding());
    let daemon = Daemon::with_agent(config.clone(), agent.clone());
    let rx = daemon.event_bus().subscribe();
    let shutdown = daemon.shutdown_handle();

    let mut lifecycle = DaemonLifecycleManager::new(&config, daemon.event_bus().clone());
    let (registry, _) = lifecycle.start().unwrap();
    let scheduler = daemon.scheduler(registry);
    let wake = scheduler.wake_handle();
    let handle = tokio::spawn(async move { daemon.run(scheduler).await });

    // Same path the CLI takes: mutate the registry, then wake the loop.
    let task = TaskRegistry::open(config.registry_path())
        .unwrap()
        .add_at("* * * * *", "/tasks/x.md", now_epoch_secs() - 120)
        .unwrap();
    wake.notify_one();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SchedulerEvent::TaskSucceeded { task_id, .. }) = rx.recv_async().await {
                if task_id == task.id {
                    break;
                }
            }
        }
    })
    .await
    .expect("task should succeed");

    shutdown.trigger();
    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(report.orphaned.is_empty());

    lifecycle.shutdown_complete().unwrap();
    assert_eq!(lifecycle.status().unwrap(), DaemonStatus::Stopped);

    let stored = TaskRegistry::open(config.registry_path())
        .unwrap()
        .get(&task.id)
        .unwrap();
    assert!(stored.last_run.is_some());
    assert_eq!(stored.consecutive_failures, 0);
    // A minute boundary may pass mid-test and fire the task again.
    assert!(agent.calls() >= 1);

    let logs = std::fs::read_dir(config.executions_dir().join(&task.id)).unwrap();
    assert!(logs.count() >= 1);
}

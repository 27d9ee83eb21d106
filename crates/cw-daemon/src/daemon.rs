use std::sync::Arc;
use std::time::Duration;

use cw_core::config::Config;
use cw_core::events::EventBus;
use cw_core::registry::TaskRegistry;
use cw_harness::agent::{AgentRunner, CommandAgent};
use cw_harness::retry::FailureTracker;
use cw_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use tracing::{error, info, warn};

use crate::executor::TaskExecutor;
use crate::monitor::ResourceMonitor;
use crate::scheduler::{DrainReport, SchedulerLoop};

/// Components that confirm drain at shutdown: the scheduler loop and the
/// resource monitor.
const DRAINING_COMPONENTS: usize = 2;

/// The cronwarden background daemon.
///
/// Owns the event bus, the shutdown signal and the agent runner, and runs
/// the scheduler loop alongside the resource monitor until shutdown.
pub struct Daemon {
    config: Config,
    events: EventBus,
    shutdown: ShutdownSignal,
    agent: Arc<dyn AgentRunner>,
}

impl Daemon {
    /// Daemon whose tasks run through the configured agent command.
    pub fn new(config: Config) -> Self {
        let agent = Arc::new(CommandAgent::from_config(&config.agent));
        Self::with_agent(config, agent)
    }

    pub fn with_agent(config: Config, agent: Arc<dyn AgentRunner>) -> Self {
        Self {
            config,
            events: EventBus::new(),
            shutdown: ShutdownSignal::new(),
            agent,
        }
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the scheduler loop over a registry handed over by lifecycle
    /// start.
    pub fn scheduler(&self, registry: TaskRegistry) -> SchedulerLoop {
        let executor = TaskExecutor::new(
            Arc::clone(&self.agent),
            FailureTracker::from_config(&self.config.retry),
            self.config.executions_dir(),
        );
        SchedulerLoop::new(
            registry,
            executor,
            self.events.clone(),
            self.config.scheduler.clone(),
        )
    }

    /// Run until the shutdown signal fires, then drain.
    pub async fn run(&self, scheduler: SchedulerLoop) -> DrainReport {
        info!(agent = %self.agent.name(), "daemon running");

        let monitor = ResourceMonitor::new(
            scheduler.cycle_counter(),
            self.events.clone(),
            Duration::from_secs(self.config.monitor.interval_secs),
        );
        let monitor_handle = tokio::spawn(monitor.run(self.shutdown.clone()));

        let report = {
            let _drained = ShutdownGuard::new(self.shutdown.clone());
            scheduler.run(self.shutdown.clone()).await
        };

        let drain = self
            .shutdown
            .wait_for_drain(DRAINING_COMPONENTS, self.config.scheduler.shutdown_grace())
            .await;
        if !drain.is_complete() {
            warn!(?drain, "not every component confirmed shutdown");
        }
        if let Err(e) = monitor_handle.await {
            error!(error = %e, "resource monitor task failed");
        }

        info!(
            completed = report.completed,
            orphaned = report.orphaned.len(),
            "daemon loops stopped"
        );
        report
    }
}

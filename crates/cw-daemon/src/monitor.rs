use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cw_core::events::{EventBus, SchedulerEvent};
use cw_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use sysinfo::{Pid, System};
use tracing::{info, warn};

/// One self-observation of the daemon process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub uptime: Duration,
    pub loop_cycles: u64,
}

/// Periodic CPU/memory/uptime sampling of the daemon itself.
///
/// Advisory only: samples go to the log stream and the event bus and are
/// never read back by the scheduler. A failed sample is logged and skipped.
pub struct ResourceMonitor {
    system: System,
    pid: Pid,
    started: Instant,
    loop_cycles: Arc<AtomicU64>,
    events: EventBus,
    interval: Duration,
}

impl ResourceMonitor {
    pub fn new(loop_cycles: Arc<AtomicU64>, events: EventBus, interval: Duration) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
            started: Instant::now(),
            loop_cycles,
            events,
            interval,
        }
    }

    /// Take one sample, or `None` if the process could not be read.
    pub fn sample(&mut self) -> Option<ResourceSample> {
        if !self.system.refresh_process(self.pid) {
            warn!(pid = %self.pid, "resource sample unavailable");
            return None;
        }
        let process = self.system.process(self.pid)?;
        Some(ResourceSample {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            uptime: self.started.elapsed(),
            loop_cycles: self.loop_cycles.load(Ordering::Relaxed),
        })
    }

    /// Sample, then log and publish the result.
    pub fn record(&mut self) -> Option<ResourceSample> {
        let sample = self.sample()?;
        info!(
            cpu_percent = sample.cpu_percent,
            memory_mb = sample.memory_bytes / (1024 * 1024),
            uptime_secs = sample.uptime.as_secs(),
            loop_cycles = sample.loop_cycles,
            "resource sample"
        );
        self.events.publish(SchedulerEvent::ResourceSample {
            cpu_percent: sample.cpu_percent,
            memory_bytes: sample.memory_bytes,
            uptime_secs: sample.uptime.as_secs(),
            loop_cycles: sample.loop_cycles,
        });
        Some(sample)
    }

    /// Sample every interval until shutdown.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        let _drained = ShutdownGuard::new(shutdown.clone());
        let mut ticker = tokio::time::interval(self.interval);
        // Consume the immediate first tick; the first sample comes one
        // interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.record();
                }
                _ = shutdown.wait() => {
                    info!("resource monitor stopping");
                    break;
                }
            }
        }
    }
}

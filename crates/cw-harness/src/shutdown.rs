use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative stop request shared by the daemon's long-running components.
///
/// Unlike a broadcast channel, the stop flag is level-triggered: a component
/// that starts waiting after [`trigger`](Self::trigger) still observes it.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// tokio::select! {
///     _ = shutdown.wait() => { /* stop dispatching */ }
///     _ = tick.tick() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    stop_tx: Arc<watch::Sender<bool>>,
    /// Components that confirmed they have drained.
    drain_tx: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (drain_tx, _) = watch::channel(0);
        Self {
            stop_tx: Arc::new(stop_tx),
            drain_tx: Arc::new(drain_tx),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Request a stop. Repeated calls are no-ops.
    pub fn trigger(&self) {
        let newly = self.stop_tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
        if newly {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolve once a stop has been requested.
    pub async fn wait(&self) {
        let mut rx = self.stop_tx.subscribe();
        // The sender lives in `self`, so this only fails if it was dropped.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Notify that a component has finished draining.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` components to confirm drain, with a timeout.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drain_tx.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|count| *count >= expected))
            .await
            .is_ok_and(|res| res.is_ok());
        let confirmed = *self.drain_tx.borrow();

        if drained {
            info!(count = confirmed, "all components drained");
            DrainResult::Complete(confirmed)
        } else {
            warn!(confirmed, expected, "drain timed out before every component confirmed");
            DrainResult::Timeout {
                confirmed,
                expected,
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// All expected components confirmed drain.
    Complete(usize),
    /// Timeout expired before all components confirmed.
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard
// ---------------------------------------------------------------------------

/// Confirms drain for one component when dropped.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_sets_flag_once() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
        assert!(signal.clone().is_shutting_down());
    }

    #[tokio::test]
    async fn late_waiter_still_sees_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let result = tokio::time::timeout(Duration::from_millis(100), signal.wait()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn waiter_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.is_ok());
    }

    #[tokio::test]
    async fn drain_completes_when_all_guards_drop() {
        let signal = ShutdownSignal::new();
        let guard1 = ShutdownGuard::new(signal.clone());
        let guard2 = ShutdownGuard::new(signal.clone());
        signal.trigger();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(guard1);
            drop(guard2);
        });

        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(result, DrainResult::Complete(2));
    }

    #[tokio::test]
    async fn drain_times_out_with_held_guard() {
        let signal = ShutdownSignal::new();
        let _guard = ShutdownGuard::new(signal.clone());
        let result = signal.wait_for_drain(1, Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
    }
}

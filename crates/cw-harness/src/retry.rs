use std::time::Duration;

use cw_core::config::RetryConfig;

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do after a failed attempt within one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `after`, then try again.
    Retry { after: Duration },
    /// The firing is over; record it as a failure.
    GiveUp,
}

// ---------------------------------------------------------------------------
// FailureTracker
// ---------------------------------------------------------------------------

/// Per-firing retry policy with exponential backoff.
///
/// The tracker only decides; it never sleeps and holds no per-task state.
/// Cross-firing bookkeeping (the persisted `consecutive_failures` counter and
/// auto-disable) lives on the task itself, see
/// [`Task::record_failure`](cw_core::types::Task::record_failure).
///
/// With the defaults a firing makes at most four attempts: the initial one
/// plus retries after 2s, 4s and 8s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTracker {
    max_retries: u32,
    base_delay: Duration,
}

impl FailureTracker {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.base_delay_ms))
    }

    /// Decide after `failures_so_far` failed attempts in the current firing.
    ///
    /// `failures_so_far` counts the attempt that just failed, so the first
    /// call after the initial attempt passes `1`.
    pub fn decide(&self, failures_so_far: u32) -> RetryDecision {
        let retry = failures_so_far.max(1);
        if retry > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            after: self.delay_for(retry),
        }
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Upper bound on attempts per firing.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_backs_off_two_four_eight() {
        let tracker = FailureTracker::default();
        assert_eq!(
            tracker.decide(1),
            RetryDecision::Retry {
                after: Duration::from_secs(2)
            }
        );
        assert_eq!(
            tracker.decide(2),
            RetryDecision::Retry {
                after: Duration::from_secs(4)
            }
        );
        assert_eq!(
            tracker.decide(3),
            RetryDecision::Retry {
                after: Duration::from_secs(8)
            }
        );
        assert_eq!(tracker.decide(4), RetryDecision::GiveUp);
        assert_eq!(tracker.max_attempts(), 4);
    }

    #[test]
    fn zero_retries_gives_up_immediately() {
        let tracker = FailureTracker::new(0, Duration::from_secs(1));
        assert_eq!(tracker.decide(1), RetryDecision::GiveUp);
        assert_eq!(tracker.max_attempts(), 1);
    }

    #[test]
    fn huge_retry_counts_do_not_overflow() {
        let tracker = FailureTracker::new(u32::MAX, Duration::from_secs(1));
        assert!(matches!(tracker.decide(200), RetryDecision::Retry { .. }));
    }

    #[test]
    fn config_millis_are_honoured() {
        let tracker = FailureTracker::from_config(&RetryConfig {
            max_retries: 2,
            base_delay_ms: 5,
        });
        assert_eq!(tracker.delay_for(2), Duration::from_millis(10));
        assert_eq!(tracker.decide(3), RetryDecision::GiveUp);
    }
}

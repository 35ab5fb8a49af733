//! Relaunch delay policy.

use std::time::Duration;

/// Linear backoff: `min(failures * step, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub step: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(500),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next launch after `sequential_failures` failed runs.
    pub fn delay_for(&self, sequential_failures: u32) -> Duration {
        self.step
            .saturating_mul(sequential_failures)
            .min(self.max)
    }
}

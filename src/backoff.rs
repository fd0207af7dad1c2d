use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay after the first failed connect.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Maps a count of consecutive connect failures to how long to wait before the next attempt.
///
/// The delay doubles with each failure, starting at the base delay and never exceeding the ceiling.
/// No failures means no wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    /// A policy with the default base delay and the given ceiling.
    pub fn new(max: Duration) -> Self {
        Self::with_base(BASE_DELAY, max)
    }

    /// A policy with a custom base delay.
    ///
    /// The base is clamped to the ceiling.
    pub fn with_base(base: Duration, max: Duration) -> Self {
        Self {
            base: base.min(max),
            max,
        }
    }

    /// The wait before the next attempt, given `failures` consecutive failures so far.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (failures - 1).min(31);

        self.base.saturating_mul(1 << exponent).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

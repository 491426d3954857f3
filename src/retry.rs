//! Backoff schedule for transient per-unit failures.
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// How a worker retries a unit the printer didn't accept.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per unit, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles after each further one.
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Adds up to 10% random extra to each delay.
    pub jitter: bool,
    /// Abandons the whole job once this many units have exhausted their
    /// retries. `None` lets every unit be tried.
    pub fail_job_after: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
            fail_job_after: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt numbered `attempt` (from 0):
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..0.1);
            delay.mul_f64(1.0 + extra).min(self.max_delay)
        } else {
            delay
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

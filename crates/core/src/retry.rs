//! Retry and backoff policies.
//!
//! The same policy type drives job retries in the worker pool, bounded publish
//! retries in the queue adapter, and broker reconnects.

use std::time::Duration;

/// How the wait grows from one failure to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    /// Always `base_delay`
    Fixed,
    /// `base_delay`, then doubled after every further failure
    #[default]
    Exponential,
}

/// Attempt budget plus the wait between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// No wait is ever longer than this
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// Three attempts, 30s then 60s apart, never more than five minutes.
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(30), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Wait before the next attempt once `failures` attempts have failed.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let delay = match (self.backoff, failures) {
            (_, 0) => Duration::ZERO,
            (Backoff::Fixed, _) => self.base_delay,
            (Backoff::Exponential, n) => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

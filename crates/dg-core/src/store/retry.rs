//! Bounded exponential backoff for lock contention.

use std::time::Duration;

use super::StoreError;

/// Retry schedule for operations that can hit a busy store.
///
/// Only [`StoreError::Locked`] is retried; every other error returns at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(200),
        }
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, StoreError>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// No retries; used by tests that want to observe the first failure.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-lock error, or the
    /// attempts are used up.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, StoreError>) -> Attempted<T> {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_locked() && attempt < max => {
                    std::thread::sleep(self.delay_for_attempt(attempt));
                    attempt += 1;
                }
                result => {
                    return Attempted {
                        result,
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

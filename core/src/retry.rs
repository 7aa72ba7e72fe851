//! Bounded exponential backoff for resource acquisition

use std::time::Duration;

use rand::Rng;

use crate::Result;

/// How often and how patiently to retry a failing operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub base_delay: Duration,
    /// Ceiling for a single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after `failures` consecutive failures (1-based)
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1 << exp).min(self.max_delay);
        if delay.is_zero() {
            return delay;
        }
        // up to 10% jitter so peers restarting together do not retry in lockstep
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
        delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Retry `op` under `policy`, returning the last error once attempts run out.
pub async fn with_backoff<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = policy.attempts.max(1);
    let mut failures = 0;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                failures += 1;
                if failures >= attempts {
                    tracing::error!("{} failed after {} attempt(s): {}", what, failures, e);
                    return Err(e);
                }
                let delay = policy.delay_after(failures);
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what,
                    failures,
                    attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

//! Exponential-backoff retry with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Retry policy for transient failures.
///
/// Defaults match the hypervisor socket clients: 3 attempts, 100 ms initial
/// delay doubling each attempt, +/-25% jitter, capped at 5 s. The caller's
/// `is_retryable` predicate decides which errors are worth re-attempting;
/// everything else propagates immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Jitter fraction applied to each delay (0.25 = +/-25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// No retries at all; for side-effecting calls (exec, file transfer).
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Backoff delay before the given attempt (1-based; attempt 1 has no
    /// delay and never reaches here).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2);
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or attempts are exhausted.
    pub async fn run<T, E, F, Fut, P>(&self, mut operation: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            if attempt > 1 {
                let delay = self.delay_for(attempt);
                debug!(attempt, ?delay, "Retrying after backoff");
                tokio::time::sleep(delay).await;
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.max_attempts || !is_retryable(&e) {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "Attempt failed, will retry");
                }
            }
        }
    }
}

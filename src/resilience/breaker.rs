//! Three-state circuit breaker.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; failures are counted.
    Closed,
    /// Failing fast; no calls pass until the cooldown elapses.
    Open,
    /// Probing; a short run of successes closes the breaker again.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker guarding one control socket.
///
/// Closed until `failure_threshold` consecutive failures, then open for
/// `cooldown`; the first permitted call afterwards runs in half-open, and
/// `success_threshold` consecutive successes close the circuit again. Any
/// half-open failure re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, 5, 2, Duration::from_secs(30))
    }

    pub fn with_settings(
        name: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            success_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed. Transitions open -> half-open once the
    /// cooldown has elapsed.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);

                if elapsed >= self.cooldown {
                    info!(breaker = %self.name, "Circuit breaker half-open, probing");
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.success_threshold {
                info!(breaker = %self.name, "Circuit breaker closed");
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;

        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "Probe failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

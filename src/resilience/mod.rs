//! Fault-handling primitives for outbound calls.
//!
//! Every hypervisor API call goes through the same stack: a per-request
//! timeout, a retry policy that only re-attempts transient failures, and a
//! circuit breaker that fails fast while a socket is known-bad.

mod breaker;
mod retry;

pub use breaker::{BreakerState, CircuitBreaker};
pub use retry::RetryPolicy;

use std::future::Future;
use std::time::Duration;

/// Await a future with a deadline, mapping expiry to the caller's error type.
pub async fn with_timeout<T, E, F>(
    duration: Duration,
    future: F,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let ok: Result<u32, String> =
            with_timeout(Duration::from_secs(1), async { Ok(7) }, || "late".to_string()).await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let late: Result<u32, String> = with_timeout(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(7)
            },
            || "late".to_string(),
        )
        .await;
        assert_eq!(late.unwrap_err(), "late");
    }
}

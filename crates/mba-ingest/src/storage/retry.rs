//! Bounded retry with exponential backoff and jitter
//!
//! Delay before the next attempt is `base * 2^(attempt - 1) + jitter`, capped at
//! `max_delay`, with jitter drawn uniformly from `[0, base)`. Only errors that
//! [`StoreError::is_retryable`] accepts are retried.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::StoreError;

/// Hard ceiling on attempts regardless of configuration
pub const MAX_ATTEMPTS_CAP: u32 = 5;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_CAP),
            base_delay,
            max_delay,
        }
    }

    /// Backoff without any sleeping, for tests and dry runs
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Deterministic part of the delay after `attempt` (1-based) failed
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Full delay including jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..base_ms))
        };
        (self.backoff(attempt) + jitter).min(self.max_delay.max(self.base_delay))
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// Returns the final result together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> (Result<T, StoreError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return (Ok(value), attempt);
                },
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => return (Err(err), attempt),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_attempts_are_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryPolicy::new(50, Duration::ZERO, Duration::ZERO).max_attempts, 5);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));

        for attempt in 1..=5 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= policy.backoff(attempt).min(Duration::from_millis(350)));
            assert!(delay <= Duration::from_millis(350));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));

        let (result, attempts) = policy
            .run("put", |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("connection reset".into()))
                } else {
                    Ok("etag")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "etag");
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_stops_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_secs(1));
        let (result, attempts) = policy
            .run("put", |_| async {
                Err::<(), _>(StoreError::Permanent("AccessDenied".into()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::Permanent(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));
        let (result, attempts) = policy
            .run("put", |attempt| async move {
                Err::<(), _>(StoreError::Transient(format!("503 on attempt {attempt}")))
            })
            .await;

        match result {
            Err(StoreError::Transient(msg)) => assert_eq!(msg, "503 on attempt 3"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(attempts, 3);
    }
}

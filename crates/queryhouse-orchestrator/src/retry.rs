//! Retry Logic for Queue Driver Calls
//!
//! Driver operations can fail transiently (SQLite lock contention, a dropped
//! connection). The queue wraps every driver call in [`retry_driver_call`],
//! which retries only errors the driver reports as retryable, with jittered
//! exponential backoff:
//!
//! ```text
//! ├─→ Attempt 1: Immediate
//! ├─→ Attempt 2: Wait ~50ms  (backoff)
//! ├─→ Attempt 3: Wait ~100ms (backoff * 2)
//! └─→ Attempt 4: Wait ~200ms (backoff * 4)
//! ```
//!
//! Handler errors are never retried here; they are the query's outcome.

use crate::config::serde_millis;
use queryhouse_observability::metrics::QUEUE_DRIVER_RETRIES_TOTAL;
use queryhouse_queue::QueueDriverError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration for exponential backoff.
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// jittered = backoff * (0.75 + random(0.0, 0.5))
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,

    /// Initial backoff duration
    #[serde(with = "serde_millis")]
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    #[serde(with = "serde_millis")]
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Backoff before retry number `attempt` (0-indexed), without jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }

    /// Backoff with ±25% jitter so many waiters do not retry in lockstep.
    pub fn jittered_backoff(&self, attempt: usize) -> Duration {
        let jitter = 0.75 + rand::random::<f64>() * 0.5;
        self.backoff(attempt).mul_f64(jitter)
    }
}

/// Run a driver call, retrying retryable failures according to `policy`.
pub async fn retry_driver_call<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, QueueDriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueDriverError>>,
{
    let mut attempt = 0;

    loop {
        match call().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(operation, attempt = attempt + 1, "Driver call succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= policy.max_retries {
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %e,
                        "Max retries exhausted, giving up"
                    );
                    return Err(e);
                }

                let backoff = policy.jittered_backoff(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retryable driver error, backing off"
                );
                QUEUE_DRIVER_RETRIES_TOTAL.with_label_values(&[operation]).inc();

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(50));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(10), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.jittered_backoff(1);
            assert!(d >= Duration::from_millis(75) && d <= Duration::from_millis(125));
        }
    }

    #[tokio::test]
    async fn test_retryable_errors_are_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = retry_driver_call(&fast_policy(3), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(QueueDriverError::Unavailable("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_driver_call(&fast_policy(3), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(QueueDriverError::Closed)
        })
        .await;

        assert!(matches!(result, Err(QueueDriverError::Closed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry_driver_call(&fast_policy(2), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(QueueDriverError::Unavailable("down".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

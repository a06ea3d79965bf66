use std::future::Future;
use std::time::Duration;

use crate::error::ProcessingError;

/// Bounded exponential backoff for transient failures inside a stage.
///
/// The policy only governs local retries: once attempts are exhausted the
/// caller emits a failed event and acknowledges the original message, so the
/// bus never redelivers in a loop.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before retry number `attempt` (0-based count of failures so far).
    pub fn time_until_next_retry(&self, attempt: u32) -> Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        match self.maximum_interval {
            Some(maximum_interval) => std::cmp::min(candidate_interval, maximum_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

/// The outcome of driving an operation through a `RetryPolicy`.
///
/// `attempts` counts how many times the operation actually ran, which is what
/// failed events record as `retry_count`.
#[derive(Debug)]
pub struct RetryExhausted {
    pub error: ProcessingError,
    pub attempts: u32,
}

/// Run `operation` under `policy`, sleeping between transient failures.
///
/// Permanent errors short-circuit on the first occurrence: retrying input
/// that will never parse only burns time. The operation receives the current
/// attempt number for logging.
pub async fn run_with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProcessingError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_transient() => {
                return Err(RetryExhausted {
                    error,
                    attempts: attempt + 1,
                })
            }
            Err(error) => {
                attempt += 1;
                if attempt >= policy.max_attempts() {
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt,
                    });
                }
                let backoff = policy.time_until_next_retry(attempt - 1);
                tracing::warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient failure, retrying: {}",
                    error
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ProcessingError;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, 2, Duration::from_millis(1), None)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 2, Duration::from_secs(1), Some(Duration::from_secs(3)));
        assert_eq!(policy.time_until_next_retry(0), Duration::from_secs(1));
        assert_eq!(policy.time_until_next_retry(1), Duration::from_secs(2));
        assert_eq!(policy.time_until_next_retry(2), Duration::from_secs(3));
        assert_eq!(policy.time_until_next_retry(5), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retries(&fast_policy(3), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProcessingError::timeout("slow backend"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retries(&fast_policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProcessingError::connection("broker down")) }
        })
        .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(exhausted.error.is_transient());
    }

    #[tokio::test]
    async fn permanent_failures_do_not_burn_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retries(&fast_policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProcessingError::parse("corrupt mbox")) }
        })
        .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!exhausted.error.is_transient());
    }
}

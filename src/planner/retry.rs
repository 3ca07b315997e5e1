//! Retry with exponential backoff and per-operation deadlines.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::ExecutionConfig;
use crate::error::ProviderError;
use crate::provider::ProviderResult;

/// How provider operations are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Cap on a single delay.
    pub max_backoff: Duration,
    /// Deadline for one attempt.
    pub operation_timeout: Duration,
}

/// Result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final outcome.
    pub result: ProviderResult<T>,
    /// Attempts made.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from execution settings.
    #[must_use]
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            operation_timeout: config.operation_timeout(),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based): doubles each time, capped.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Runs `operation` until it succeeds, fails permanently, or the budget
    /// runs out.
    ///
    /// An attempt exceeding the deadline counts as a transient failure. A
    /// transient failure on the last attempt is reported as permanent.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = match tokio::time::timeout(self.operation_timeout, operation()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::transient(format!(
                    "{label} timed out after {}s",
                    self.operation_timeout.as_secs_f64()
                ))),
            };

            match outcome {
                Err(err) if err.is_retryable() => {
                    if attempts >= self.max_attempts {
                        return Attempted {
                            result: Err(ProviderError::permanent(format!(
                                "gave up after {attempts} attempts: {}",
                                err.message
                            ))),
                            attempts,
                        };
                    }
                    let delay = self.backoff(attempts);
                    warn!(
                        operation = label,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err.message,
                        "Transient provider failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return Attempted { result, attempts },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            operation_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4000));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = &AtomicU32::new(0);
        let attempted = fast(5)
            .run("create apprepo", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::transient("throttled"))
                } else {
                    Ok("repo-1")
                }
            })
            .await;
        assert_eq!(attempted.result.expect("eventually ok"), "repo-1");
        assert_eq!(attempted.attempts, 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_permanent() {
        let attempted: Attempted<()> = fast(3)
            .run("delete apprepo", || async { Err(ProviderError::transient("503")) })
            .await;
        let err = attempted.result.expect_err("exhausted");
        assert_eq!(err.kind, ProviderErrorKind::Permanent);
        assert!(err.message.contains("gave up after 3 attempts"));
        assert_eq!(attempted.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_and_not_found_are_not_retried() {
        let attempted: Attempted<()> = fast(5)
            .run("update", || async { Err(ProviderError::permanent("invalid")) })
            .await;
        assert_eq!(attempted.attempts, 1);

        let attempted: Attempted<()> = fast(5)
            .run("read", || async { Err(ProviderError::not_found("gone")) })
            .await;
        assert!(attempted.result.expect_err("missing").is_not_found());
        assert_eq!(attempted.attempts, 1);
    }

    #[tokio::test]
    async fn test_deadline_counts_as_transient() {
        let calls = &AtomicU32::new(0);
        let attempted = fast(2)
            .run("create slow", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(7)
            })
            .await;
        assert_eq!(attempted.result.expect("second attempt"), 7);
        assert_eq!(attempted.attempts, 2);

        let attempted: Attempted<()> = fast(2)
            .run("create stuck", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = attempted.result.expect_err("timed out twice");
        assert!(err.message.contains("timed out"));
    }
}

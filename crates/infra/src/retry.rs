//! Bounded retry with backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use payflow_core::LedgerResult;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
///
/// `max_attempts` counts retries, not the first try: a policy with
/// `max_attempts = 3` runs an operation at most four times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Maximum delay cap
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(2),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given retry number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so concurrent retriers do not move in lockstep.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if more retries are allowed after `attempt` retries so far.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// Only errors whose kind is retryable are retried; the last error is
    /// returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> LedgerResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && self.should_retry(attempt) => {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use payflow_core::{ErrorKind, LedgerError};

    #[test]
    fn exponential_delays_are_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(500))
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(50));
        assert!(fixed.should_retry(2));
        assert!(!fixed.should_retry(3));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            ..RetryPolicy::fixed(3, Duration::from_millis(10))
        };
        let linear = RetryPolicy {
            max_delay: Duration::from_secs(1),
            ..linear
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(30));
    }

    #[test]
    fn deserializes_from_millis() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 2, "base_delay": 5, "strategy": "fixed"}"#)
                .unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(5));
        assert_eq!(policy.strategy, BackoffStrategy::Fixed);
    }

    #[tokio::test]
    async fn run_retries_only_retryable_errors() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run("conflicting", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(LedgerError::conflict("lost race"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);

        calls.store(0, Ordering::SeqCst);
        let err = policy
            .run("permanent", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LedgerError::account_not_found("gone")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccountNotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let err = policy
            .run("flaky", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LedgerError::transient_store("connection reset")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientStoreError);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

//! Retry with deterministic exponential backoff

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Failure after the full attempt budget, wrapping the final cause
#[derive(Debug, thiserror::Error)]
#[error("Exhausted {attempts} attempts: {source}")]
pub struct ExhaustedRetries<E: std::error::Error> {
    pub attempts: u32,
    #[source]
    pub source: E,
}

impl From<ExhaustedRetries<crate::error::EncoreError>> for crate::error::EncoreError {
    fn from(e: ExhaustedRetries<crate::error::EncoreError>) -> Self {
        Self::ExhaustedRetries {
            attempts: e.attempts,
            source: Box::new(e.source),
        }
    }
}

/// Retry configuration for a wrapped operation.
///
/// The delay before attempt `n + 1` is
/// `min(base_delay * backoff_factor^(n-1), max_delay)`. No jitter is applied,
/// so the delay sequence is deterministic. Wrapped operations run once per
/// attempt and must tolerate re-execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied per additional failure
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60000),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Result<Self, crate::error::EncoreError> {
        if max_attempts == 0 {
            return Err(crate::error::EncoreError::InvalidArgument(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if backoff_factor < 1.0 {
            return Err(crate::error::EncoreError::InvalidArgument(
                "backoff_factor must be at least 1.0".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_factor,
        })
    }

    /// Delay applied after the given (1-indexed) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let millis = self.base_delay.as_millis() as f64 * exp;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// Returns the first success, or [`ExhaustedRetries`] wrapping the last
    /// error.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, ExhaustedRetries<E>>
    where
        E: std::error::Error,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(source) if attempt >= self.max_attempts => {
                    return Err(ExhaustedRetries {
                        attempts: self.max_attempts,
                        source,
                    });
                }
                Err(error) => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, ?delay, error = %error, "Attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn test_invalid_policy_rejected() {
        assert!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 2.0).is_err());
        assert!(RetryPolicy::new(3, Duration::ZERO, Duration::ZERO, 0.5).is_err());
    }

    #[test]
    fn test_delay_sequence_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_factor: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(4), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = quick_policy(5);

        let calls2 = calls.clone();
        let out = policy
            .run(move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(crate::error::EncoreError::Transient("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let policy = quick_policy(3);
        let err = policy
            .run(|| async { Err::<(), _>(crate::error::EncoreError::Transient("always".into())) })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert!(err.source.to_string().contains("always"));
    }

    #[tokio::test]
    async fn test_total_backoff_time_is_deterministic() {
        // 3 attempts with 10ms/20ms between them: 30ms of sleeps total
        let policy = quick_policy(3);
        let start = Instant::now();
        let _ = policy
            .run(|| async { Err::<(), _>(crate::error::EncoreError::Transient("x".into())) })
            .await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(30), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "elapsed {elapsed:?}");
    }
}

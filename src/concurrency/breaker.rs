//! Circuit breaker for unhealthy external dependencies

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Calls are blocked until the recovery timeout elapses
    Open,
    /// Recovery window reached; the next call runs as a probe
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Error from a circuit-protected call
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E: std::error::Error> {
    /// The dependency is suspected unhealthy; the operation was not invoked
    #[error("Circuit open, retry in {retry_in:?}")]
    Open { retry_in: Duration },

    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

impl From<BreakerError<crate::error::EncoreError>> for crate::error::EncoreError {
    fn from(e: BreakerError<crate::error::EncoreError>) -> Self {
        match e {
            BreakerError::Open { retry_in } => Self::CircuitOpen { retry_in },
            BreakerError::Inner(inner) => inner,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Trips after `failure_threshold` consecutive failures, fails fast while
/// open, and probes recovery with a single call once the timeout elapses.
///
/// One instance protects one dependency; call sites that share the
/// dependency share the instance. Probes are not serialized: callers that
/// observe the half-open window concurrently may each issue one, and the
/// first recorded outcome drives the next transition.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Run an operation under circuit protection
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(retry_in) = self.refuse() {
            return Err(BreakerError::Open { retry_in });
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(BreakerError::Inner(error))
            }
        }
    }

    /// Current state, transitioning Open -> HalfOpen if the window elapsed
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        if state.state == CircuitState::Open && self.recovery_elapsed(&state) {
            state.state = CircuitState::HalfOpen;
        }
        state.state
    }

    /// Consecutive failures recorded since the last success
    pub fn failure_count(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Reset to closed with a clean failure counter
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.last_failure = None;
    }

    /// Force the circuit open (maintenance or tests)
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Open;
        state.last_failure = Some(Instant::now());
    }

    /// Returns the remaining wait if the call must be refused
    fn refuse(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => None,
            CircuitState::Open => {
                if self.recovery_elapsed(&state) {
                    debug!("Recovery window elapsed, probing");
                    state.state = CircuitState::HalfOpen;
                    None
                } else {
                    let since = state
                        .last_failure
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::ZERO);
                    Some(self.config.recovery_timeout.saturating_sub(since))
                }
            }
        }
    }

    fn recovery_elapsed(&self, state: &BreakerState) -> bool {
        state
            .last_failure
            .map(|t| t.elapsed() >= self.config.recovery_timeout)
            .unwrap_or(true)
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.state = CircuitState::Closed;
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());

        match state.state {
            CircuitState::HalfOpen => {
                warn!("Probe failed, circuit re-opened");
                state.state = CircuitState::Open;
            }
            CircuitState::Closed
                if state.consecutive_failures >= self.config.failure_threshold =>
            {
                warn!(
                    failures = state.consecutive_failures,
                    "Failure threshold reached, circuit opened"
                );
                state.state = CircuitState::Open;
            }
            _ => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EncoreError;

    fn fast_breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
        })
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<EncoreError>> {
        cb.call(|| async { Err::<(), _>(EncoreError::Transient("down".into())) })
            .await
    }

    #[tokio::test]
    async fn test_stays_closed_on_success() {
        let cb = CircuitBreaker::default();
        let out = cb.call(|| async { Ok::<_, EncoreError>(1) }).await.unwrap();
        assert_eq!(out, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = fast_breaker(3, 10_000);

        for _ in 0..3 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // blocked without invoking the operation
        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result = cb
            .call(|| async {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), EncoreError>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = fast_breaker(3, 10_000);

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.failure_count(), 2);

        cb.call(|| async { Ok::<(), EncoreError>(()) }).await.unwrap();
        assert_eq!(cb.failure_count(), 0);

        // two more failures are below the threshold again
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let cb = fast_breaker(1, 50);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.call(|| async { Ok::<(), EncoreError>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let cb = fast_breaker(1, 50);

        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(matches!(fail(&cb).await, Err(BreakerError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        // the fresh failure restarts the recovery window
        assert!(matches!(fail(&cb).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let cb = fast_breaker(5, 10_000);
        cb.force_open();
        assert!(matches!(fail(&cb).await, Err(BreakerError::Open { .. })));

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.call(|| async { Ok::<(), EncoreError>(()) }).await.unwrap();
    }
}

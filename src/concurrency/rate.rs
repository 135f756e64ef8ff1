//! Sliding-window rate limiter for external service calls

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::trace;

use crate::error::EncoreError;

/// Caps how many calls *start* within any trailing time window.
///
/// A caller over the cap is suspended until the oldest retained call leaves
/// the window; the wait is a timer-driven loop, never a hard failure.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Result<Self, EncoreError> {
        if max_calls == 0 {
            return Err(EncoreError::InvalidArgument(
                "max_calls must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(EncoreError::InvalidArgument(
                "time window must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::new()),
        })
    }

    /// Wait until a call may start, then record it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                Self::prune(&mut calls, now, self.window);

                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }

                // The front entry is the oldest retained call; a slot opens
                // the moment it exits the window.
                calls
                    .front()
                    .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO)
            };

            trace!(?wait, "Rate window full, waiting");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Run a future once the window allows it
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        self.acquire().await;
        fut.await
    }

    /// Calls recorded in the current window
    pub async fn current_usage(&self) -> usize {
        let mut calls = self.calls.lock().await;
        Self::prune(&mut calls, Instant::now(), self.window);
        calls.len()
    }

    /// Remaining quota in the current window
    pub async fn remaining(&self) -> usize {
        self.max_calls.saturating_sub(self.current_usage().await)
    }

    fn prune(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = calls.front() {
            if now.duration_since(*front) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        assert!(RateLimiter::new(0, Duration::from_secs(1)).is_err());
        assert!(RateLimiter::new(5, Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_under_cap_is_immediate() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1)).unwrap();

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.current_usage().await, 3);
        assert_eq!(limiter.remaining().await, 0);
    }

    #[tokio::test]
    async fn test_over_cap_waits_for_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(100)).unwrap();

        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();

        // the third call cannot start until the first leaves the window
        assert!(waited >= Duration::from_millis(80), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_window_recycles() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50)).unwrap();

        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(limiter.current_usage().await, 0);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_run_wraps_future() {
        let limiter = RateLimiter::new(10, Duration::from_secs(1)).unwrap();
        let out = limiter.run(async { 21 * 2 }).await;
        assert_eq!(out, 42);
        assert_eq!(limiter.current_usage().await, 1);
    }
}

//! Concurrency primitives for calling rate-limited external services
//!
//! Provides:
//! - Bounded concurrency limiting (max N operations in flight)
//! - Deterministic exponential retry/backoff
//! - Circuit breaking around unhealthy dependencies
//! - Sliding-window rate limiting
//!
//! Each primitive is an owned instance shared by the call sites that share a
//! dependency; none of them is a process-global.

mod breaker;
mod limiter;
mod rate;
mod retry;

pub use breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use limiter::{LimitError, Limiter, LimiterPermit};
pub use rate::RateLimiter;
pub use retry::{ExhaustedRetries, RetryPolicy};

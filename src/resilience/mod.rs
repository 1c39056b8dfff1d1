//! Resilience primitives: per-tool admission control and per-upstream
//! circuit breaking.
//!
//! Both keep their mutable state behind a single `std::sync::Mutex` per
//! instance. Critical sections are synchronous and never span an `.await`.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitConfig, CircuitError,
    CircuitPermit, CircuitState, CircuitStatus, Classify, FailureKind,
};
pub use rate_limiter::{RateLimitConfig, RateLimitRule, RateLimiter};

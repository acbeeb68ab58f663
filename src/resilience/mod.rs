//! Failure isolation and admission control.
//!
//! # Components
//! - [`CircuitBreaker`]: per-backend Closed / Open / HalfOpen state machine,
//!   with [`CircuitBreakerRegistry`] creating one lazily per backend.
//! - [`SlidingWindowLimiter`]: per-key request admission over a trailing
//!   window, exposed as [`RateLimitMiddleware`].
//! - [`RetryPolicy`]: capped exponential backoff between proxy attempts.

mod circuit_breaker;
mod rate_limit;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use rate_limit::{RateLimitMiddleware, SlidingWindowLimiter};
pub use retry::RetryPolicy;

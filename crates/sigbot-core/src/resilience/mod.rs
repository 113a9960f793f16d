//! Downstream protection: rate limiting, per-endpoint circuit breaking, and
//! the outbound guard that combines them for handlers.

pub mod circuit_breaker;
pub mod outbound;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSettings, GuardError};
pub use outbound::OutboundGuard;
pub use rate_limiter::RateLimiter;

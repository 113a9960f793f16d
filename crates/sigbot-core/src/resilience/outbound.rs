//! Guard for handler-initiated downstream calls.

use std::future::Future;
use std::sync::Arc;

use sigbot_types::error::HandlerError;

use super::circuit_breaker::{CircuitBreaker, GuardError};
use super::rate_limiter::RateLimiter;

/// Combines the shared rate limiter and circuit breaker for outbound calls.
///
/// Handlers reach it through `MessageContext::outbound()`. A call first waits
/// for a rate-limit permit, then runs under the breaker for its endpoint.
#[derive(Debug, Clone)]
pub struct OutboundGuard {
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

impl OutboundGuard {
    pub fn new(rate_limiter: Arc<RateLimiter>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { rate_limiter, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Run `call` against `endpoint` with rate limiting and circuit breaking.
    pub async fn call<T, E, F>(&self, endpoint: &str, call: F) -> Result<T, HandlerError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<HandlerError>,
    {
        self.rate_limiter.acquire().await;
        match self.breaker.guard(endpoint, call).await {
            Ok(value) => Ok(value),
            Err(GuardError::Open(e)) => Err(HandlerError::CircuitOpen(e)),
            Err(GuardError::Inner(e)) => Err(e.into()),
        }
    }
}

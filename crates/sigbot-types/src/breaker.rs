//! Circuit breaker state shared between the core and operational tooling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one endpoint's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// A single trial call decides between Closed and Open.
    HalfOpen,
}

impl CircuitState {
    pub const ALL: [CircuitState; 3] = [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen];
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Read-only view of one endpoint, as returned by `CircuitBreaker::status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub state: CircuitState,
    pub requests: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub successes: u64,
}

/// A state change published to breaker subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub endpoint: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

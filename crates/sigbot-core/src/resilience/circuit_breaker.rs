//! Per-endpoint circuit breaker.
//!
//! One state machine per endpoint key, kept in a `DashMap` owned by the
//! breaker instance. A call goes through [`CircuitBreaker::guard`], which
//! either rejects it up front (circuit open) or runs it and records the
//! outcome. Every state change is published on a broadcast channel and
//! mirrored into the runtime metrics gauge.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sigbot_types::breaker::{BreakerTransition, CircuitState, EndpointStatus};
use sigbot_types::config::CircuitBreakerConfig;
use sigbot_types::error::CircuitOpenError;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::metrics::RuntimeMetrics;

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// Thresholds controlling when a circuit opens and how long it stays open.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial.
    pub reset_timeout: Duration,
    /// Failure ratio that opens the circuit once enough requests were seen.
    pub failure_rate_threshold: f64,
    pub min_requests_for_rate_calc: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for CircuitBreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout(),
            failure_rate_threshold: config.failure_rate_threshold,
            min_requests_for_rate_calc: config.min_requests_for_rate_calc,
        }
    }
}

/// Result of a guarded call that did not succeed.
#[derive(Debug)]
pub enum GuardError<E> {
    /// The circuit rejected the call; it was never executed.
    Open(CircuitOpenError),
    /// The call ran and failed. The breaker has recorded the failure.
    Inner(E),
}

impl<E> GuardError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, GuardError::Open(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            GuardError::Inner(e) => Some(e),
            GuardError::Open(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::Open(e) => e.fmt(f),
            GuardError::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuardError::Open(e) => Some(e),
            GuardError::Inner(e) => Some(e),
        }
    }
}

#[derive(Debug)]
struct EndpointState {
    state: CircuitState,
    requests: u64,
    failures: u64,
    consecutive_failures: u32,
    successes: u64,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every transition; outcomes from an older epoch are ignored.
    epoch: u64,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            requests: 0,
            failures: 0,
            consecutive_failures: 0,
            successes: 0,
            last_failure_time: None,
            trial_in_flight: false,
            epoch: 0,
        }
    }

    /// Move to `to`, resetting every counter.
    fn transition(&mut self, endpoint: &str, to: CircuitState) -> BreakerTransition {
        let from = self.state;
        self.state = to;
        self.requests = 0;
        self.failures = 0;
        self.consecutive_failures = 0;
        self.successes = 0;
        self.trial_in_flight = false;
        self.epoch += 1;
        if to == CircuitState::Open {
            self.last_failure_time = Some(Instant::now());
        }
        BreakerTransition {
            endpoint: endpoint.to_string(),
            from,
            to,
        }
    }
}

/// Ticket for an admitted call.
struct Admission {
    epoch: u64,
    trial: bool,
}

/// Releases the half-open trial slot if the trial future is dropped before
/// it completes.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    endpoint: &'a str,
    epoch: u64,
    armed: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(mut entry) = self.breaker.endpoints.get_mut(self.endpoint) {
            if entry.epoch == self.epoch {
                entry.trial_in_flight = false;
                tracing::debug!(endpoint = %self.endpoint, "half-open trial abandoned, slot released");
            }
        }
    }
}

/// Per-endpoint circuit breaker registry.
pub struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    endpoints: DashMap<String, EndpointState>,
    transitions: broadcast::Sender<BreakerTransition>,
    metrics: Arc<RuntimeMetrics>,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitBreakerSettings, metrics: Arc<RuntimeMetrics>) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            settings,
            endpoints: DashMap::new(),
            transitions,
            metrics,
        }
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    /// Receive every future state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Current state of `endpoint`. Unknown endpoints are closed.
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.endpoints
            .get(endpoint)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of every known endpoint, sorted by key.
    pub fn status(&self) -> Vec<EndpointStatus> {
        let mut status: Vec<EndpointStatus> = self
            .endpoints
            .iter()
            .map(|entry| EndpointStatus {
                endpoint: entry.key().clone(),
                state: entry.state,
                requests: entry.requests,
                failures: entry.failures,
                consecutive_failures: entry.consecutive_failures,
                successes: entry.successes,
            })
            .collect();
        status.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        status
    }

    /// Run `call` under the breaker for `endpoint`.
    ///
    /// Returns `GuardError::Open` without polling `call` when the circuit is
    /// open (or a half-open trial is already running). Otherwise the call
    /// runs and its error, if any, comes back as `GuardError::Inner` after
    /// being recorded.
    pub async fn guard<T, E, F>(&self, endpoint: &str, call: F) -> Result<T, GuardError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let admission = self.admit(endpoint).map_err(GuardError::Open)?;
        let mut slot = TrialSlot {
            breaker: self,
            endpoint,
            epoch: admission.epoch,
            armed: admission.trial,
        };

        let result = call.await;
        slot.armed = false;

        match result {
            Ok(value) => {
                self.record_success(endpoint, admission.epoch);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(endpoint, admission.epoch);
                Err(GuardError::Inner(e))
            }
        }
    }

    fn admit(&self, endpoint: &str) -> Result<Admission, CircuitOpenError> {
        let mut created = false;
        let mut transition = None;
        let admission = {
            let mut entry = self.endpoints.entry(endpoint.to_string()).or_insert_with(|| {
                created = true;
                EndpointState::new()
            });

            let mut trial = false;
            match entry.state {
                CircuitState::Closed => {}
                CircuitState::Open => {
                    let elapsed = entry
                        .last_failure_time
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed < self.settings.reset_timeout {
                        return Err(CircuitOpenError {
                            endpoint: endpoint.to_string(),
                        });
                    }
                    transition = Some(entry.transition(endpoint, CircuitState::HalfOpen));
                    entry.trial_in_flight = true;
                    trial = true;
                }
                CircuitState::HalfOpen => {
                    if entry.trial_in_flight {
                        return Err(CircuitOpenError {
                            endpoint: endpoint.to_string(),
                        });
                    }
                    entry.trial_in_flight = true;
                    trial = true;
                }
            }

            entry.requests += 1;
            Admission {
                epoch: entry.epoch,
                trial,
            }
        };

        if created {
            self.metrics.set_breaker_state(endpoint, CircuitState::Closed);
        }
        if let Some(transition) = transition {
            self.announce(transition);
        }
        Ok(admission)
    }

    fn record_success(&self, endpoint: &str, epoch: u64) {
        let transition = {
            let Some(mut entry) = self.endpoints.get_mut(endpoint) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            entry.successes += 1;
            entry.consecutive_failures = 0;
            (entry.state == CircuitState::HalfOpen).then(|| entry.transition(endpoint, CircuitState::Closed))
        };
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    fn record_failure(&self, endpoint: &str, epoch: u64) {
        let transition = {
            let Some(mut entry) = self.endpoints.get_mut(endpoint) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            entry.failures += 1;
            entry.consecutive_failures += 1;

            let rate_tripped = entry.requests >= self.settings.min_requests_for_rate_calc
                && entry.requests > 0
                && entry.failures as f64 / entry.requests as f64 >= self.settings.failure_rate_threshold;
            let should_trip = entry.state == CircuitState::HalfOpen
                || entry.consecutive_failures >= self.settings.failure_threshold
                || rate_tripped;

            should_trip.then(|| entry.transition(endpoint, CircuitState::Open))
        };
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    fn announce(&self, transition: BreakerTransition) {
        match transition.to {
            CircuitState::Open => tracing::warn!(
                endpoint = %transition.endpoint,
                from = %transition.from,
                "circuit breaker tripped, now open"
            ),
            CircuitState::HalfOpen => tracing::info!(endpoint = %transition.endpoint, "circuit breaker half-open"),
            CircuitState::Closed => tracing::info!(endpoint = %transition.endpoint, "circuit breaker reset, now closed"),
        }
        self.metrics.set_breaker_state(&transition.endpoint, transition.to);
        // No subscribers is fine.
        let _ = self.transitions.send(transition);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("settings", &self.settings)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

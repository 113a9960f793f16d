//! Ingestion pause coordination.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::metrics::RuntimeMetrics;

/// Longest single sleep in `wait_if_paused`, so a `resume_now()` is noticed promptly.
const MAX_PAUSE_SLICE: Duration = Duration::from_secs(1);

/// Point-in-time view of the pause state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeSnapshot {
    /// Time left until intake resumes, if paused.
    pub remaining: Option<Duration>,
    pub default_pause: Duration,
}

/// A single "paused until" watermark shared by everything that wants the
/// listener to back off (queue overflow, an opened circuit).
///
/// Pausing never shortens an existing pause. The transport connection stays
/// up while paused; frames simply wait in the listener.
#[derive(Debug)]
pub struct IntakeController {
    default_pause: Duration,
    paused_until: Mutex<Option<Instant>>,
    metrics: Arc<RuntimeMetrics>,
}

impl IntakeController {
    pub fn new(default_pause: Duration, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            default_pause,
            paused_until: Mutex::new(None),
            metrics,
        }
    }

    /// Pause intake for `duration` (or the default), extending any current pause.
    pub fn pause(&self, reason: &str, duration: Option<Duration>) {
        let duration = duration.unwrap_or(self.default_pause);
        let requested = Instant::now() + duration;
        let until = {
            let mut paused_until = self.paused_until.lock().expect("intake lock poisoned");
            let until = match *paused_until {
                Some(current) if current >= requested => current,
                _ => requested,
            };
            *paused_until = Some(until);
            until
        };
        self.metrics.record_ingest_pause(reason);
        tracing::warn!(
            reason,
            pause_ms = duration.as_millis() as u64,
            remaining_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
            "ingest paused"
        );
    }

    /// Wait until any current pause has elapsed. Returns at once when not paused.
    pub async fn wait_if_paused(&self) {
        loop {
            let Some(remaining) = self.remaining() else {
                return;
            };
            tokio::time::sleep(remaining.min(MAX_PAUSE_SLICE)).await;
        }
    }

    /// Clear the pause immediately.
    pub fn resume_now(&self) {
        *self.paused_until.lock().expect("intake lock poisoned") = None;
        tracing::info!("ingest resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.remaining().is_some()
    }

    pub fn snapshot(&self) -> IntakeSnapshot {
        IntakeSnapshot {
            remaining: self.remaining(),
            default_pause: self.default_pause,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        let paused_until = *self.paused_until.lock().expect("intake lock poisoned");
        let remaining = paused_until?.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }
}

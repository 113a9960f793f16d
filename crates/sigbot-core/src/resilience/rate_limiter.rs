//! Sliding-window rate limiter shared by every outbound caller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::metrics::RuntimeMetrics;

/// Grants at most `rate_limit` permits in any trailing window of `period`.
///
/// Callers are serialized by an async lock that is held across the wait, so
/// permits are granted in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    rate_limit: usize,
    period: Duration,
    window: Mutex<VecDeque<Instant>>,
    metrics: Arc<RuntimeMetrics>,
}

impl RateLimiter {
    /// `rate_limit` is clamped to at least 1.
    pub fn new(rate_limit: usize, period: Duration, metrics: Arc<RuntimeMetrics>) -> Self {
        let rate_limit = rate_limit.max(1);
        Self {
            rate_limit,
            period,
            window: Mutex::new(VecDeque::with_capacity(rate_limit)),
            metrics,
        }
    }

    /// Wait until a permit is available, then take it.
    pub async fn acquire(&self) {
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();
            self.evict(&mut window, now);

            if window.len() < self.rate_limit {
                window.push_back(now);
                return;
            }

            // Non-empty: len >= rate_limit >= 1.
            let Some(oldest) = window.front().copied() else {
                continue;
            };
            let wait = (oldest + self.period).saturating_duration_since(now);
            self.metrics.observe_rate_limit_wait(wait);
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Permits left in the current window.
    pub async fn available(&self) -> usize {
        let mut window = self.window.lock().await;
        self.evict(&mut window, Instant::now());
        self.rate_limit.saturating_sub(window.len())
    }

    fn evict(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = window.front() {
            if *front + self.period <= now {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

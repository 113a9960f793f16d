//! Processing watermark over accepted frames.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
struct WatermarkState {
    /// Multiset of `enqueued_at` for accepted-but-unfinished items.
    outstanding: BTreeMap<DateTime<Utc>, usize>,
    newest_finished: Option<DateTime<Utc>>,
    /// Persisted entries at or after this stamp were never accepted.
    held: Option<DateTime<Utc>>,
}

/// Tracks which accepted frames are still in flight.
///
/// The listener calls [`track`](Self::track) for every accepted frame and
/// workers call [`finish`](Self::finish) once the frame is done, whatever the
/// outcome. Everything older than [`low_watermark`](Self::low_watermark) is
/// fully processed, so the replay buffer can drop it.
#[derive(Debug, Default)]
pub struct IngestWatermark {
    state: Mutex<WatermarkState>,
}

impl IngestWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, enqueued_at: DateTime<Utc>) {
        let mut state = self.state.lock().expect("watermark lock poisoned");
        *state.outstanding.entry(enqueued_at).or_insert(0) += 1;
    }

    /// Mark one item stamped `enqueued_at` as done. Unknown stamps are ignored.
    pub fn finish(&self, enqueued_at: DateTime<Utc>) {
        let mut state = self.state.lock().expect("watermark lock poisoned");
        let Some(count) = state.outstanding.get_mut(&enqueued_at) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            state.outstanding.remove(&enqueued_at);
        }
        if state.newest_finished.is_none_or(|newest| enqueued_at > newest) {
            state.newest_finished = Some(enqueued_at);
        }
    }

    /// Oldest outstanding stamp; the newest finished stamp when nothing is
    /// outstanding; `None` before any item finished.
    pub fn low_watermark(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().expect("watermark lock poisoned");
        state
            .outstanding
            .keys()
            .next()
            .copied()
            .or(state.newest_finished)
    }

    /// Keep the compaction floor at or below `floor` for the life of this
    /// watermark. Used for persisted entries that recovery could not accept.
    /// Repeated holds keep the lowest stamp.
    pub fn hold(&self, floor: DateTime<Utc>) {
        let mut state = self.state.lock().expect("watermark lock poisoned");
        state.held = Some(state.held.map_or(floor, |held| held.min(floor)));
    }

    /// Smallest `enqueued_at` that may still need processing: the oldest
    /// outstanding stamp, or just past the newest finished one when nothing
    /// is outstanding, never above a [`hold`](Self::hold). Entries strictly
    /// older can be discarded.
    pub fn compaction_floor(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().expect("watermark lock poisoned");
        let floor = match state.outstanding.keys().next() {
            Some(oldest) => Some(*oldest),
            None => state
                .newest_finished
                .map(|newest| newest + chrono::Duration::microseconds(1)),
        };
        match (floor, state.held) {
            (Some(floor), Some(held)) => Some(floor.min(held)),
            (floor, _) => floor,
        }
    }

    pub fn outstanding(&self) -> usize {
        let state = self.state.lock().expect("watermark lock poisoned");
        state.outstanding.values().sum()
    }
}

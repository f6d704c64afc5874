//! Batch segmentation.
//!
//! Frames from all cameras are grouped into batches: contiguous runs of
//! activity separated by inactivity gaps longer than the configured minimum
//! interval. A single [`BatchTracker`] is shared by every acquisition worker
//! so that all cameras agree on batch boundaries even though each polls its
//! own device independently.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};

/// Identifier for one batch, derived from the wall-clock time at batch start.
///
/// The format (`2024-03-01_14-05-22_183204`) carries microsecond resolution so
/// ids are unique, sorts lexicographically in chronological order, and doubles
/// as the batch directory name. The leading 10 characters are the date prefix
/// used to group batches by day.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(String);

impl BatchId {
    pub fn from_time(t: SystemTime) -> Self {
        let dt: DateTime<Local> = t.into();
        BatchId(dt.format("%Y-%m-%d_%H-%M-%S_%6f").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `YYYY-MM-DD` prefix, used as the per-day output directory.
    pub fn date_prefix(&self) -> &str {
        &self.0[..10]
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct TrackerState {
    last_frame_time: SystemTime,
    current: BatchId,
}

/// Shared decision maker converting frame arrival times into batch ids.
///
/// The critical section is pure computation; no I/O happens under the lock.
pub struct BatchTracker {
    min_batch_interval: Duration,
    state: Mutex<TrackerState>,
}

impl BatchTracker {
    pub fn new(min_batch_interval: Duration, now: SystemTime) -> Self {
        BatchTracker {
            min_batch_interval,
            state: Mutex::new(TrackerState {
                last_frame_time: now,
                current: BatchId::from_time(now),
            }),
        }
    }

    pub fn min_batch_interval(&self) -> Duration {
        self.min_batch_interval
    }

    /// Record a frame arrival and return the batch it belongs to.
    ///
    /// If more than the minimum interval has elapsed since the previous
    /// arrival (from any camera), a new batch id is minted from `now`. The
    /// first caller to observe the gap mints the id; concurrent callers
    /// inside the same gap see the already-updated id, so no two ids are
    /// ever assigned for one gap.
    pub fn observe(&self, now: SystemTime) -> BatchId {
        let mut state = self.state.lock().unwrap();
        let elapsed = now
            .duration_since(state.last_frame_time)
            .unwrap_or_default();
        if elapsed > self.min_batch_interval {
            state.current = BatchId::from_time(now);
        }
        state.last_frame_time = now;
        state.current.clone()
    }

    /// Batch id that the next non-gap frame would be assigned.
    pub fn current_batch(&self) -> BatchId {
        self.state.lock().unwrap().current.clone()
    }

    /// Time elapsed since the last observed frame from any camera.
    pub fn idle_for(&self, now: SystemTime) -> Duration {
        let state = self.state.lock().unwrap();
        now.duration_since(state.last_frame_time)
            .unwrap_or_default()
    }
}

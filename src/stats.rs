//! Shared recording statistics.
//!
//! Acquisition workers count frames accepted per (camera, batch); saver
//! workers count frames written and dropped. The batch report thread and the
//! final session report read both sides to surface any divergence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::batch::BatchId;

#[derive(Default)]
struct StatsInner {
    accepted: BTreeMap<(String, BatchId), u64>,
    written: BTreeMap<(String, BatchId), u64>,
    dropped: BTreeMap<(String, BatchId), u64>,
}

/// Cheap-to-clone handle to the per-session counters.
#[derive(Clone, Default)]
pub struct RecordingStats {
    inner: Arc<Mutex<StatsInner>>,
}

/// One camera's numbers for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLine {
    pub camera: String,
    pub accepted: u64,
    pub written: u64,
    pub dropped: u64,
}

impl RecordingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self, camera: &str, batch: &BatchId) {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .accepted
            .entry((camera.to_string(), batch.clone()))
            .or_insert(0) += 1;
    }

    pub fn record_written(&self, camera: &str, batch: &BatchId) {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .written
            .entry((camera.to_string(), batch.clone()))
            .or_insert(0) += 1;
    }

    pub fn record_dropped(&self, camera: &str, batch: &BatchId) {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .dropped
            .entry((camera.to_string(), batch.clone()))
            .or_insert(0) += 1;
    }

    /// All batch ids seen by any camera, in chronological order.
    pub fn batches(&self) -> Vec<BatchId> {
        let inner = self.inner.lock().unwrap();
        let mut ids: BTreeSet<BatchId> = BTreeSet::new();
        for (_, batch) in inner.accepted.keys() {
            ids.insert(batch.clone());
        }
        for (_, batch) in inner.written.keys() {
            ids.insert(batch.clone());
        }
        ids.into_iter().collect()
    }

    /// Per-camera numbers for one batch, sorted by camera name.
    pub fn batch_lines(&self, batch: &BatchId) -> Vec<BatchLine> {
        let inner = self.inner.lock().unwrap();
        let mut cameras: BTreeSet<&String> = BTreeSet::new();
        for (camera, b) in inner.accepted.keys() {
            if b == batch {
                cameras.insert(camera);
            }
        }
        for (camera, b) in inner.written.keys() {
            if b == batch {
                cameras.insert(camera);
            }
        }
        cameras
            .into_iter()
            .map(|camera| {
                let key = (camera.clone(), batch.clone());
                BatchLine {
                    camera: camera.clone(),
                    accepted: inner.accepted.get(&key).copied().unwrap_or(0),
                    written: inner.written.get(&key).copied().unwrap_or(0),
                    dropped: inner.dropped.get(&key).copied().unwrap_or(0),
                }
            })
            .collect()
    }

    /// True when every camera in the batch wrote the same number of frames.
    /// A mismatch means at least one camera missed triggers or dropped data.
    pub fn batch_counts_aligned(&self, batch: &BatchId) -> bool {
        let lines = self.batch_lines(batch);
        let mut counts = lines.iter().map(|l| l.written);
        match counts.next() {
            Some(first) => counts.all(|c| c == first),
            None => true,
        }
    }

    /// Total frames accepted but never written, across the session.
    pub fn total_unwritten(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        let accepted: u64 = inner.accepted.values().sum();
        let written: u64 = inner.written.values().sum();
        accepted.saturating_sub(written)
    }
}

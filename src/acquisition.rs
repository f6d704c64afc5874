//! Acquisition workers.
//!
//! One worker per camera polls its [`FrameSource`] with a short bounded
//! timeout, tags accepted frames with the shared batch id and a per-batch
//! sequence index, and publishes them to every consumer queue for that
//! camera. The worker is the sole producer for its camera's queues.
//!
//! State machine: Starting -> Acquiring -> Draining -> Stopped. The external
//! stop signal is a [`CancellationToken`] checked once per poll iteration, so
//! the longest a stop request can wait is one poll timeout.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchId, BatchTracker};
use crate::fanout::FanOut;
use crate::frame::{Frame, QueueEntry};
use crate::source::{FramePoll, FrameSource};
use crate::stats::RecordingStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Starting,
    Acquiring,
    Draining,
    Stopped,
}

pub struct AcquisitionWorker {
    source: Box<dyn FrameSource>,
    tracker: Arc<BatchTracker>,
    fanout: FanOut,
    cancel: CancellationToken,
    stats: RecordingStats,
    poll_timeout: Duration,
    pending_warn_threshold: usize,
    state: WorkerState,
}

impl AcquisitionWorker {
    pub fn new(
        source: Box<dyn FrameSource>,
        tracker: Arc<BatchTracker>,
        fanout: FanOut,
        cancel: CancellationToken,
        stats: RecordingStats,
        poll_timeout: Duration,
        pending_warn_threshold: usize,
    ) -> Self {
        AcquisitionWorker {
            source,
            tracker,
            fanout,
            cancel,
            stats,
            poll_timeout,
            pending_warn_threshold,
            state: WorkerState::Starting,
        }
    }

    fn transition(&mut self, camera: &str, next: WorkerState) {
        debug!("[{}] {:?} -> {:?}", camera, self.state, next);
        self.state = next;
    }

    /// Run until cancelled or a fatal device error. Blocking; one thread per
    /// camera.
    pub fn run(mut self) -> Result<()> {
        let camera = self.source.name().to_string();
        if let Err(e) = self.source.begin() {
            self.transition(&camera, WorkerState::Stopped);
            error!("[{}] Failed to begin acquisition: {:#}", camera, e);
            return Err(e);
        }
        self.transition(&camera, WorkerState::Acquiring);
        info!("[{}] Acquiring images...", camera);

        let mut current_batch: Option<BatchId> = None;
        let mut seq: u64 = 0;
        let mut emitted_in_batch = false;
        let mut result = Ok(());

        while !self.cancel.is_cancelled() {
            // Idle-gap boundary: if this camera has emitted frames in the
            // current batch and the whole rig has gone quiet past the batch
            // interval, close out the batch now rather than waiting for the
            // next trigger train.
            if emitted_in_batch
                && self.tracker.idle_for(SystemTime::now()) > self.tracker.min_batch_interval()
            {
                debug!("[{}] Idle gap, emitting end-of-batch", camera);
                self.fanout.publish(QueueEntry::EndOfBatch);
                emitted_in_batch = false;
                seq = 0;
            }

            let pending = self.source.pending_count();
            if pending > self.pending_warn_threshold {
                warn!("[{}] {} frames backed up in device buffer", camera, pending);
            }

            match self.source.next(self.poll_timeout) {
                Ok(FramePoll::Timeout) => continue,
                Ok(FramePoll::Incomplete) => {
                    warn!("[{}] Incomplete frame, skipping", camera);
                    continue;
                }
                Ok(FramePoll::Captured(captured)) => {
                    let batch = self.tracker.observe(captured.timestamp);
                    if current_batch.as_ref() != Some(&batch) {
                        // Only mark the boundary if the previous batch
                        // actually produced frames on this camera.
                        if emitted_in_batch {
                            self.fanout.publish(QueueEntry::EndOfBatch);
                        }
                        seq = 0;
                        emitted_in_batch = false;
                        current_batch = Some(batch.clone());
                    }

                    let frame = Frame {
                        data: captured.data,
                        width: captured.width,
                        height: captured.height,
                        timestamp: captured.timestamp,
                        batch: batch.clone(),
                        seq,
                    };
                    self.stats.record_accepted(&camera, &batch);
                    self.fanout.publish(QueueEntry::Frame(frame));
                    seq += 1;
                    emitted_in_batch = true;
                }
                Err(e) => {
                    error!("[{}] Device error, stopping camera: {:#}", camera, e);
                    result = Err(e);
                    break;
                }
            }
        }

        self.transition(&camera, WorkerState::Draining);
        if let Err(e) = self.source.end() {
            warn!("[{}] Error releasing device: {:#}", camera, e);
        }
        self.transition(&camera, WorkerState::Stopped);
        info!("[{}] Acquisition stopped", camera);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedSource, Step};

    fn worker_with(
        steps: Vec<Step>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> (AcquisitionWorker, flume::Receiver<QueueEntry>, RecordingStats) {
        let source = ScriptedSource::new("camA", steps);
        let tracker = Arc::new(BatchTracker::new(interval, SystemTime::now()));
        let mut fanout = FanOut::new();
        let rx = fanout.subscribe();
        let stats = RecordingStats::new();
        let worker = AcquisitionWorker::new(
            Box::new(source),
            tracker,
            fanout,
            cancel,
            stats.clone(),
            Duration::from_millis(1),
            10,
        );
        (worker, rx, stats)
    }

    fn drain(rx: &flume::Receiver<QueueEntry>) -> Vec<QueueEntry> {
        let mut out = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            out.push(entry);
        }
        out
    }

    #[test]
    fn frames_tagged_with_sequence_and_batch() {
        let cancel = CancellationToken::new();
        let (worker, rx, stats) = worker_with(
            vec![Step::Frame, Step::Timeout, Step::Frame, Step::Frame],
            Duration::from_secs(10),
            cancel.clone(),
        );
        let handle = std::thread::spawn(move || worker.run());
        // Script exhausts into timeouts; cancel ends the loop.
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        handle.join().unwrap().unwrap();

        let entries = drain(&rx);
        let seqs: Vec<u64> = entries
            .iter()
            .filter_map(|e| match e {
                QueueEntry::Frame(f) => Some(f.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        let batches: Vec<BatchId> = entries
            .iter()
            .filter_map(|e| match e {
                QueueEntry::Frame(f) => Some(f.batch.clone()),
                _ => None,
            })
            .collect();
        assert!(batches.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(stats.total_unwritten(), 3, "3 accepted, none written here");
    }

    #[test]
    fn batch_gap_injects_end_of_batch_and_resets_seq() {
        let cancel = CancellationToken::new();
        // Two frames 10ms apart, then one 500ms later: with a 100ms interval
        // the third frame starts a new batch.
        let (worker, rx, _) = worker_with(
            vec![
                Step::FrameAt(Duration::from_millis(10)),
                Step::FrameAt(Duration::from_millis(20)),
                Step::FrameAt(Duration::from_millis(500)),
            ],
            Duration::from_millis(100),
            cancel.clone(),
        );
        let handle = std::thread::spawn(move || worker.run());
        // Cancel after the third frame but before the idle gap would add
        // another boundary marker.
        std::thread::sleep(Duration::from_millis(550));
        cancel.cancel();
        handle.join().unwrap().unwrap();

        let entries = drain(&rx);
        let shape: Vec<String> = entries
            .iter()
            .map(|e| match e {
                QueueEntry::Frame(f) => format!("f{}", f.seq),
                QueueEntry::EndOfBatch => "eob".into(),
                QueueEntry::EndOfStream => "eos".into(),
            })
            .collect();
        assert_eq!(shape, vec!["f0", "f1", "eob", "f0"]);
    }

    #[test]
    fn incomplete_frames_are_skipped() {
        let cancel = CancellationToken::new();
        let (worker, rx, _) = worker_with(
            vec![Step::Frame, Step::Incomplete, Step::Frame],
            Duration::from_secs(10),
            cancel.clone(),
        );
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        handle.join().unwrap().unwrap();

        let frames = drain(&rx)
            .into_iter()
            .filter(|e| matches!(e, QueueEntry::Frame(_)))
            .count();
        assert_eq!(frames, 2);
    }

    #[test]
    fn fatal_error_stops_worker_and_releases_device() {
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new("camA", vec![Step::Frame, Step::Fatal]);
        let ended = source.ended_flag();
        let tracker = Arc::new(BatchTracker::new(Duration::from_secs(1), SystemTime::now()));
        let mut fanout = FanOut::new();
        let rx = fanout.subscribe();
        let worker = AcquisitionWorker::new(
            Box::new(source),
            tracker,
            fanout,
            cancel,
            RecordingStats::new(),
            Duration::from_millis(1),
            10,
        );

        let result = worker.run();
        assert!(result.is_err());
        assert!(*ended.lock().unwrap(), "device must be released on fatal error");
        assert_eq!(drain(&rx).len(), 1, "one frame before the failure");
    }

    #[test]
    fn cancel_stops_promptly_without_sentinel() {
        let cancel = CancellationToken::new();
        let (worker, rx, _) = worker_with(vec![], Duration::from_secs(10), cancel.clone());
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        handle.join().unwrap().unwrap();
        // EndOfStream is the orchestrator's job, after the join.
        assert!(drain(&rx).is_empty());
    }
}

//! Saver workers.
//!
//! One saver per consumer queue drains `QueueEntry`s and persists frames
//! through a [`VideoSink`]. Sinks are opened lazily on the first frame of a
//! batch (an `EndOfBatch` alone never creates a file) and closed on batch end
//! or stream end. A sink that fails to open or write degrades that (camera,
//! batch) to dropping; acquisition and later batches are unaffected.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::batch::BatchId;
use crate::frame::{Frame, QueueEntry};
use crate::sink::{SinkFactory, VideoSink};
use crate::stats::RecordingStats;

/// What a saver reports back after its queue is fully drained.
#[derive(Debug, Default)]
pub struct SaverSummary {
    pub batches_closed: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    /// Sinks that could not be finalized cleanly. Non-zero here turns into a
    /// non-zero process exit code.
    pub unclosed_sinks: u64,
}

struct OpenSink {
    sink: Box<dyn VideoSink>,
    batch: BatchId,
    written: u64,
    opened_at: Instant,
}

pub struct SaverWorker {
    camera: String,
    rx: flume::Receiver<QueueEntry>,
    factory: Arc<dyn SinkFactory>,
    stats: RecordingStats,
    current: Option<OpenSink>,
    /// Batch currently being dropped after a sink failure.
    dropping: Option<BatchId>,
    summary: SaverSummary,
}

impl SaverWorker {
    pub fn new(
        camera: impl Into<String>,
        rx: flume::Receiver<QueueEntry>,
        factory: Arc<dyn SinkFactory>,
        stats: RecordingStats,
    ) -> Self {
        SaverWorker {
            camera: camera.into(),
            rx,
            factory,
            stats,
            current: None,
            dropping: None,
            summary: SaverSummary::default(),
        }
    }

    /// Drain the queue until `EndOfStream`. Blocking; run on its own thread.
    pub fn run(mut self) -> SaverSummary {
        loop {
            // Blocking here is safe: the orchestrator guarantees an
            // EndOfStream sentinel after the producer has been joined.
            let entry = match self.rx.recv() {
                Ok(entry) => entry,
                Err(_) => {
                    warn!("[{}] Queue closed without EndOfStream", self.camera);
                    break;
                }
            };
            match entry {
                QueueEntry::Frame(frame) => self.handle_frame(frame),
                QueueEntry::EndOfBatch => {
                    self.close_current();
                    self.dropping = None;
                }
                QueueEntry::EndOfStream => break,
            }
        }
        self.close_current();
        info!(
            "[{}] Saver done: {} frames written, {} dropped, {} batches",
            self.camera,
            self.summary.frames_written,
            self.summary.frames_dropped,
            self.summary.batches_closed
        );
        self.summary
    }

    fn handle_frame(&mut self, frame: Frame) {
        if self.dropping.as_ref() == Some(&frame.batch) {
            self.drop_frame(&frame.batch);
            return;
        }

        // A batch change without an explicit EndOfBatch still closes the
        // previous sink; the marker can be missing when a saver pool shares
        // one queue.
        let batch_changed = self
            .current
            .as_ref()
            .is_some_and(|open| open.batch != frame.batch);
        if batch_changed {
            self.close_current();
        }

        if self.current.is_none() {
            match self.factory.open(&self.camera, &frame.batch) {
                Ok(sink) => {
                    self.current = Some(OpenSink {
                        sink,
                        batch: frame.batch.clone(),
                        written: 0,
                        opened_at: Instant::now(),
                    });
                    self.dropping = None;
                }
                Err(e) => {
                    error!(
                        "[{}] Failed to open sink for batch {}: {:#}; dropping frames until next batch",
                        self.camera, frame.batch, e
                    );
                    self.dropping = Some(frame.batch.clone());
                    self.drop_frame(&frame.batch);
                    return;
                }
            }
        }

        let Some(open) = self.current.as_mut() else {
            return;
        };
        match open.sink.write(&frame) {
            Ok(()) => {
                open.written += 1;
                self.summary.frames_written += 1;
                self.stats.record_written(&self.camera, &frame.batch);
            }
            Err(e) => {
                error!(
                    "[{}] Write failed for batch {}: {:#}; dropping rest of batch",
                    self.camera, frame.batch, e
                );
                self.close_current();
                self.dropping = Some(frame.batch.clone());
                self.drop_frame(&frame.batch);
            }
        }
    }

    fn drop_frame(&mut self, batch: &BatchId) {
        self.summary.frames_dropped += 1;
        self.stats.record_dropped(&self.camera, batch);
    }

    fn close_current(&mut self) {
        let Some(open) = self.current.take() else {
            return;
        };
        let elapsed = open.opened_at.elapsed();
        let fps = if elapsed.as_secs_f64() > 0.0 {
            open.written as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        match open.sink.close() {
            Ok(frames) => {
                self.summary.batches_closed += 1;
                info!(
                    "[{}] Batch {} closed: {} frames in {:.2}s (~{:.1} fps)",
                    self.camera,
                    open.batch,
                    frames,
                    elapsed.as_secs_f64(),
                    fps
                );
            }
            Err(e) => {
                self.summary.unclosed_sinks += 1;
                error!(
                    "[{}] Failed to close sink for batch {}: {:#}",
                    self.camera, open.batch, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FanOut;
    use crate::test_support::{frame_in, MemorySinkFactory};
    use std::time::{Duration, SystemTime};

    fn batch(offset_ms: u64) -> BatchId {
        BatchId::from_time(
            SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_000 + offset_ms),
        )
    }

    fn run_saver(
        entries: Vec<QueueEntry>,
        factory: Arc<MemorySinkFactory>,
    ) -> (SaverSummary, RecordingStats) {
        let mut fanout = FanOut::new();
        let rx = fanout.subscribe();
        for entry in entries {
            fanout.publish(entry);
        }
        let stats = RecordingStats::new();
        let saver = SaverWorker::new("camA", rx, factory, stats.clone());
        (saver.run(), stats)
    }

    #[test]
    fn k_frames_no_boundary_single_ordered_sink() {
        let b = batch(0);
        let factory = Arc::new(MemorySinkFactory::new());
        let mut entries: Vec<QueueEntry> =
            (0..7).map(|seq| QueueEntry::Frame(frame_in(&b, seq))).collect();
        entries.push(QueueEntry::EndOfStream);

        let (summary, _) = run_saver(entries, Arc::clone(&factory));

        assert_eq!(summary.frames_written, 7);
        assert_eq!(summary.unclosed_sinks, 0);
        let files = factory.closed_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].camera, "camA");
        assert_eq!(files[0].batch, b);
        assert_eq!(files[0].seqs, (0..7).collect::<Vec<u64>>());
    }

    #[test]
    fn end_of_batch_splits_files() {
        // [Frame(0), Frame(1), EndOfBatch, Frame(0 new batch), EndOfStream]
        let b1 = batch(0);
        let b2 = batch(5000);
        let factory = Arc::new(MemorySinkFactory::new());
        let entries = vec![
            QueueEntry::Frame(frame_in(&b1, 0)),
            QueueEntry::Frame(frame_in(&b1, 1)),
            QueueEntry::EndOfBatch,
            QueueEntry::Frame(frame_in(&b2, 0)),
            QueueEntry::EndOfStream,
        ];

        let (summary, _) = run_saver(entries, Arc::clone(&factory));

        assert_eq!(summary.batches_closed, 2);
        let files = factory.closed_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].batch, b1);
        assert_eq!(files[0].seqs, vec![0, 1]);
        assert_eq!(files[1].batch, b2);
        assert_eq!(files[1].seqs, vec![0]);
    }

    #[test]
    fn end_of_batch_without_frames_creates_no_file() {
        let factory = Arc::new(MemorySinkFactory::new());
        let entries = vec![
            QueueEntry::EndOfBatch,
            QueueEntry::EndOfBatch,
            QueueEntry::EndOfStream,
        ];
        let (summary, _) = run_saver(entries, Arc::clone(&factory));
        assert_eq!(summary.batches_closed, 0);
        assert!(factory.closed_files().is_empty());
    }

    #[test]
    fn end_of_stream_mid_batch_closes_sink() {
        let b = batch(0);
        let factory = Arc::new(MemorySinkFactory::new());
        let entries = vec![
            QueueEntry::Frame(frame_in(&b, 0)),
            QueueEntry::Frame(frame_in(&b, 1)),
            QueueEntry::EndOfStream,
        ];
        let (summary, _) = run_saver(entries, Arc::clone(&factory));
        assert_eq!(summary.batches_closed, 1);
        assert_eq!(factory.closed_files()[0].seqs, vec![0, 1]);
        assert_eq!(factory.open_count(), 0, "no sink may remain open");
    }

    #[test]
    fn open_failure_drops_batch_but_not_the_next() {
        let b1 = batch(0);
        let b2 = batch(5000);
        let factory = Arc::new(MemorySinkFactory::new());
        factory.fail_open_for(&b1);
        let entries = vec![
            QueueEntry::Frame(frame_in(&b1, 0)),
            QueueEntry::Frame(frame_in(&b1, 1)),
            QueueEntry::EndOfBatch,
            QueueEntry::Frame(frame_in(&b2, 0)),
            QueueEntry::Frame(frame_in(&b2, 1)),
            QueueEntry::EndOfStream,
        ];

        let (summary, stats) = run_saver(entries, Arc::clone(&factory));

        assert_eq!(summary.frames_dropped, 2);
        assert_eq!(summary.frames_written, 2);
        let files = factory.closed_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].batch, b2);
        assert_eq!(files[0].seqs, vec![0, 1]);
        assert!(!stats.batches().is_empty());
    }

    #[test]
    fn write_failure_degrades_to_dropping() {
        let b = batch(0);
        let factory = Arc::new(MemorySinkFactory::new());
        factory.fail_write_after(1);
        let entries = vec![
            QueueEntry::Frame(frame_in(&b, 0)),
            QueueEntry::Frame(frame_in(&b, 1)),
            QueueEntry::Frame(frame_in(&b, 2)),
            QueueEntry::EndOfStream,
        ];
        let (summary, _) = run_saver(entries, Arc::clone(&factory));
        assert_eq!(summary.frames_written, 1);
        assert_eq!(summary.frames_dropped, 2);
    }

    #[test]
    fn missing_end_of_batch_marker_still_splits() {
        let b1 = batch(0);
        let b2 = batch(5000);
        let factory = Arc::new(MemorySinkFactory::new());
        let entries = vec![
            QueueEntry::Frame(frame_in(&b1, 0)),
            QueueEntry::Frame(frame_in(&b2, 0)),
            QueueEntry::EndOfStream,
        ];
        let (summary, _) = run_saver(entries, Arc::clone(&factory));
        assert_eq!(summary.batches_closed, 2);
        assert_eq!(factory.closed_files().len(), 2);
    }
}

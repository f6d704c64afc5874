//! Recording session orchestration.
//!
//! The orchestrator owns the whole lifecycle: it wires one acquisition
//! worker and one-or-more saver workers per camera, runs the diagnostic
//! threads, and on stop tears everything down in an order that cannot lose
//! in-flight frames:
//!
//! 1. cancel the shared token (acquisition workers stop enqueuing),
//! 2. join all acquisition workers; after this, no producer is alive,
//! 3. push one `EndOfStream` sentinel per consumer per queue,
//! 4. join all saver workers,
//! 5. stop and join the diagnostic threads,
//! 6. release device resources (done by each worker as it exits).
//!
//! Pushing sentinels only after the producer join is what prevents a
//! sentinel from overtaking a late in-flight frame and truncating the
//! recording.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acquisition::AcquisitionWorker;
use crate::batch::{BatchId, BatchTracker};
use crate::config::RecorderConfig;
use crate::fanout::FanOut;
use crate::frame::QueueEntry;
use crate::saver::{SaverSummary, SaverWorker};
use crate::sink::SinkFactory;
use crate::source::FrameSource;
use crate::stats::{BatchLine, RecordingStats};

/// Final accounting for one recording session.
#[derive(Debug, Default)]
pub struct SessionReport {
    /// Per batch, per camera: accepted vs written vs dropped.
    pub batches: Vec<(BatchId, Vec<BatchLine>)>,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub failed_cameras: Vec<String>,
    pub unclosed_sinks: u64,
    pub free_space_gb: Option<f64>,
}

impl SessionReport {
    /// Clean means every camera initialized and every sink was finalized.
    pub fn is_clean(&self) -> bool {
        self.failed_cameras.is_empty() && self.unclosed_sinks == 0
    }
}

struct CameraStream {
    name: String,
    fanout: FanOut,
    // Taken when the producer is joined during shutdown.
    acquisition: Option<JoinHandle<Result<()>>>,
    savers: Vec<JoinHandle<SaverSummary>>,
}

pub struct Orchestrator {
    cameras: Vec<(String, Box<dyn FrameSource>)>,
    factory: Arc<dyn SinkFactory>,
    tracker: Arc<BatchTracker>,
    stats: RecordingStats,
    cancel: CancellationToken,
    output_dir: PathBuf,
    poll_timeout: Duration,
    savers_per_camera: usize,
    pending_warn_threshold: usize,
    queue_warn_depth: usize,
    min_free_gb: f64,
}

impl Orchestrator {
    pub fn new(
        config: &RecorderConfig,
        cameras: Vec<(String, Box<dyn FrameSource>)>,
        factory: Arc<dyn SinkFactory>,
    ) -> Self {
        Orchestrator {
            cameras,
            factory,
            tracker: Arc::new(BatchTracker::new(
                config.min_batch_interval(),
                SystemTime::now(),
            )),
            stats: RecordingStats::new(),
            cancel: CancellationToken::new(),
            output_dir: config.output_dir.clone(),
            poll_timeout: config.grab_timeout(),
            savers_per_camera: config.saver_threads_per_camera.max(1),
            pending_warn_threshold: config.pending_warn_threshold,
            queue_warn_depth: config.queue_warn_depth,
            min_free_gb: config.min_free_gb,
        }
    }

    /// Token to cancel from outside (signal handler, duration timer).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> RecordingStats {
        self.stats.clone()
    }

    /// Run the session until the cancel token fires, then drain and report.
    /// Blocking; call from a dedicated thread or `spawn_blocking`.
    pub fn run(mut self) -> Result<SessionReport> {
        let mut streams = Vec::new();
        for (name, source) in self.cameras.drain(..) {
            let mut fanout = FanOut::new();

            // One shared queue per camera; flume is MPMC, so every member of
            // the saver pool drains the same receiver and each frame is
            // persisted exactly once. Distinct consumers (a display, ...)
            // would subscribe their own queue instead.
            let rx = fanout.subscribe();
            let mut savers = Vec::new();
            for i in 0..self.savers_per_camera {
                let saver = SaverWorker::new(
                    name.clone(),
                    rx.clone(),
                    Arc::clone(&self.factory),
                    self.stats.clone(),
                );
                savers.push(
                    std::thread::Builder::new()
                        .name(format!("save-{name}-{i}"))
                        .spawn(move || saver.run())?,
                );
            }

            let worker = AcquisitionWorker::new(
                source,
                Arc::clone(&self.tracker),
                fanout.clone(),
                self.cancel.clone(),
                self.stats.clone(),
                self.poll_timeout,
                self.pending_warn_threshold,
            );
            let acquisition = std::thread::Builder::new()
                .name(format!("acq-{name}"))
                .spawn(move || worker.run())?;

            streams.push(CameraStream {
                name,
                fanout,
                acquisition: Some(acquisition),
                savers,
            });
        }

        // Diagnostics run until saving has fully drained, on their own token.
        let diag_cancel = CancellationToken::new();
        let depth_monitor = self.spawn_depth_monitor(&streams, diag_cancel.clone())?;
        let batch_reporter = self.spawn_batch_reporter(diag_cancel.clone())?;

        info!(
            "Recording from {} camera(s); waiting for stop signal",
            streams.len()
        );
        while !self.cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(100));
        }

        // (1)+(2) producers first.
        let mut failed_cameras = Vec::new();
        for stream in &mut streams {
            match stream.acquisition.take().map(|h| h.join()) {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(_))) => failed_cameras.push(stream.name.clone()),
                Some(Err(_)) => {
                    error!("[{}] Acquisition thread panicked", stream.name);
                    failed_cameras.push(stream.name.clone());
                }
                None => {}
            }
        }
        info!("Finished acquiring images");

        // (3) one sentinel per consumer, guaranteed to arrive after every
        // frame because the producers are gone.
        for stream in &streams {
            for _ in 0..self.savers_per_camera {
                stream.fanout.publish(QueueEntry::EndOfStream);
            }
        }

        // (4) wait for savers.
        let mut report = SessionReport {
            failed_cameras,
            ..SessionReport::default()
        };
        for stream in streams {
            for saver in stream.savers {
                match saver.join() {
                    Ok(summary) => {
                        report.frames_written += summary.frames_written;
                        report.frames_dropped += summary.frames_dropped;
                        report.unclosed_sinks += summary.unclosed_sinks;
                    }
                    Err(_) => {
                        error!("[{}] Saver thread panicked", stream.name);
                        report.unclosed_sinks += 1;
                    }
                }
            }
        }
        info!("Finished saving images");

        // (5) diagnostics last; they also observe the drain phase.
        diag_cancel.cancel();
        let _ = depth_monitor.join();
        let _ = batch_reporter.join();

        for batch in self.stats.batches() {
            report
                .batches
                .push((batch.clone(), self.stats.batch_lines(&batch)));
        }
        report.free_space_gb = crate::disk::check_free_space(&self.output_dir, self.min_free_gb);
        Ok(report)
    }

    /// Samples queue depths a few times a second; quiet unless a consumer
    /// is falling behind.
    fn spawn_depth_monitor(
        &self,
        streams: &[CameraStream],
        cancel: CancellationToken,
    ) -> std::io::Result<JoinHandle<()>> {
        let fanouts: Vec<(String, FanOut)> = streams
            .iter()
            .map(|s| (s.name.clone(), s.fanout.clone()))
            .collect();
        let warn_depth = self.queue_warn_depth;
        std::thread::Builder::new()
            .name("queue-monitor".into())
            .spawn(move || {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(250));
                    for (name, fanout) in &fanouts {
                        for (idx, depth) in fanout.depths().into_iter().enumerate() {
                            if depth > warn_depth {
                                warn!(
                                    "[{}] queue #{} depth {}, saver falling behind",
                                    name, idx, depth
                                );
                            }
                        }
                    }
                }
            })
    }

    /// Once a batch has been idle past the interval, log the per-camera
    /// written counts and flag any divergence.
    fn spawn_batch_reporter(&self, cancel: CancellationToken) -> std::io::Result<JoinHandle<()>> {
        let tracker = Arc::clone(&self.tracker);
        let stats = self.stats.clone();
        let output_dir = self.output_dir.clone();
        let min_free_gb = self.min_free_gb;
        std::thread::Builder::new()
            .name("batch-report".into())
            .spawn(move || {
                let mut reported: Vec<BatchId> = Vec::new();
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(250));
                    if tracker.idle_for(SystemTime::now()) <= tracker.min_batch_interval() {
                        continue;
                    }
                    let current = tracker.current_batch();
                    if reported.contains(&current) {
                        continue;
                    }
                    let lines = stats.batch_lines(&current);
                    if lines.is_empty() {
                        continue;
                    }
                    // Give the savers a beat to finish closing the files.
                    std::thread::sleep(Duration::from_millis(250));

                    let lines = stats.batch_lines(&current);
                    info!("Batch {} complete:", current);
                    for line in &lines {
                        info!(
                            "  {}: {} accepted, {} written, {} dropped",
                            line.camera, line.accepted, line.written, line.dropped
                        );
                    }
                    if !stats.batch_counts_aligned(&current) {
                        warn!(
                            "Batch {}: cameras disagree on written frame counts; check triggers and disk",
                            current
                        );
                    }
                    crate::disk::check_free_space(&output_dir, min_free_gb);
                    reported.push(current);
                }
            })
    }
}

//! In-memory doubles for the external collaborators (camera device, video
//! encoder), shared across the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use bytes::Bytes;

use crate::batch::BatchId;
use crate::frame::Frame;
use crate::sink::{SinkFactory, VideoSink};
use crate::source::{CapturedFrame, FramePoll, FrameSource};

pub fn frame_in(batch: &BatchId, seq: u64) -> Frame {
    Frame {
        data: Bytes::from_static(&[0u8; 16]),
        width: 4,
        height: 4,
        timestamp: SystemTime::now(),
        batch: batch.clone(),
        seq,
    }
}

/// One finalized in-memory "file".
#[derive(Debug, Clone)]
pub struct ClosedFile {
    pub camera: String,
    pub batch: BatchId,
    pub seqs: Vec<u64>,
}

#[derive(Default)]
struct MemoryState {
    closed: Vec<ClosedFile>,
    open: usize,
    fail_open_batches: Vec<BatchId>,
    fail_write_after: Option<u64>,
}

/// Sink factory recording every write in memory.
#[derive(Default)]
pub struct MemorySinkFactory {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `open` fail for the given batch (disk-full simulation).
    pub fn fail_open_for(&self, batch: &BatchId) {
        self.state
            .lock()
            .unwrap()
            .fail_open_batches
            .push(batch.clone());
    }

    /// Make sinks fail after `n` successful writes.
    pub fn fail_write_after(&self, n: u64) {
        self.state.lock().unwrap().fail_write_after = Some(n);
    }

    pub fn closed_files(&self) -> Vec<ClosedFile> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().open
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, camera: &str, batch: &BatchId) -> Result<Box<dyn VideoSink>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open_batches.contains(batch) {
            anyhow::bail!("simulated open failure for batch {batch}");
        }
        state.open += 1;
        Ok(Box::new(MemorySink {
            camera: camera.to_string(),
            batch: batch.clone(),
            seqs: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemorySink {
    camera: String,
    batch: BatchId,
    seqs: Vec<u64>,
    state: Arc<Mutex<MemoryState>>,
}

impl VideoSink for MemorySink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let fail_after = self.state.lock().unwrap().fail_write_after;
        if let Some(n) = fail_after {
            if self.seqs.len() as u64 >= n {
                anyhow::bail!("simulated write failure");
            }
        }
        self.seqs.push(frame.seq);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.open -= 1;
        let frames = self.seqs.len() as u64;
        state.closed.push(ClosedFile {
            camera: self.camera,
            batch: self.batch,
            seqs: self.seqs,
        });
        Ok(frames)
    }
}

/// What a scripted source yields on successive `next` calls.
pub enum Step {
    Frame,
    /// Emit a frame with the given wall-clock offset from the source epoch.
    FrameAt(Duration),
    Timeout,
    Incomplete,
    Fatal,
}

/// Deterministic frame source driven by a prepared script.
pub struct ScriptedSource {
    name: String,
    epoch: SystemTime,
    steps: Mutex<VecDeque<Step>>,
    began: bool,
    ended: Arc<Mutex<bool>>,
    clock: Duration,
}

impl ScriptedSource {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        ScriptedSource {
            name: name.into(),
            // Anchored to real time so the worker's wall-clock idle check
            // agrees with the scripted timestamps.
            epoch: SystemTime::now(),
            steps: Mutex::new(steps.into()),
            began: false,
            ended: Arc::new(Mutex::new(false)),
            clock: Duration::ZERO,
        }
    }

    /// Shared flag flipped by `end()`, for asserting device release.
    pub fn ended_flag(&self) -> Arc<Mutex<bool>> {
        Arc::clone(&self.ended)
    }
}

impl FrameSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, _params: &[(String, String)]) -> Result<()> {
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.began = true;
        Ok(())
    }

    fn next(&mut self, _timeout: Duration) -> Result<FramePoll> {
        assert!(self.began, "next() before begin()");
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Frame) => {
                self.clock += Duration::from_millis(10);
                Ok(FramePoll::Captured(CapturedFrame {
                    data: Bytes::from_static(&[0u8; 16]),
                    width: 4,
                    height: 4,
                    timestamp: self.epoch + self.clock,
                }))
            }
            Some(Step::FrameAt(offset)) => {
                self.clock = offset;
                // Pace against the wall clock so concurrent sources observe
                // the shared tracker in timestamp order.
                if let Ok(wait) = (self.epoch + offset).duration_since(SystemTime::now()) {
                    std::thread::sleep(wait);
                }
                Ok(FramePoll::Captured(CapturedFrame {
                    data: Bytes::from_static(&[0u8; 16]),
                    width: 4,
                    height: 4,
                    timestamp: self.epoch + self.clock,
                }))
            }
            Some(Step::Timeout) => Ok(FramePoll::Timeout),
            Some(Step::Incomplete) => Ok(FramePoll::Incomplete),
            Some(Step::Fatal) => anyhow::bail!("simulated device failure"),
            // Script exhausted: behave like a silent trigger line.
            None => Ok(FramePoll::Timeout),
        }
    }

    fn end(&mut self) -> Result<()> {
        *self.ended.lock().unwrap() = true;
        Ok(())
    }
}

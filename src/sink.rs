//! Video sinks.
//!
//! A sink is the open output handle for one (camera, batch) video file. The
//! encoder itself is an external collaborator behind the [`VideoSink`] /
//! [`SinkFactory`] seam; the shipped implementation pipes raw frames into an
//! `ffmpeg` child process, one container file per (camera, batch).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use anyhow::{Context, Result};

use crate::batch::BatchId;
use crate::frame::Frame;

/// Pixel layout of the raw frames handed to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Gray8,
    Rgb24,
}

impl PixelLayout {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb24 => 3,
        }
    }

    fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelLayout::Gray8 => "gray",
            PixelLayout::Rgb24 => "rgb24",
        }
    }
}

/// Geometry and rate the encoder is configured with.
#[derive(Debug, Clone, Copy)]
pub struct SinkSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel: PixelLayout,
}

impl SinkSpec {
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel.bytes_per_pixel()
    }
}

/// Open output handle for one (camera, batch) file.
///
/// Owned exclusively by one saver worker; never shared.
pub trait VideoSink: Send {
    /// Append one frame. Frames arrive in capture order.
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and finalize the file, returning the number of frames written.
    fn close(self: Box<Self>) -> Result<u64>;
}

/// Creates sinks on demand as batches begin.
pub trait SinkFactory: Send + Sync {
    fn open(&self, camera: &str, batch: &BatchId) -> Result<Box<dyn VideoSink>>;
}

/// Resolve the output file for one (camera, batch) pair:
/// `<base>/<YYYY-MM-DD>/<category>/<BatchId>/<camera>.<ext>`.
pub fn batch_output_path(
    base: &Path,
    category: &str,
    batch: &BatchId,
    camera: &str,
    ext: &str,
) -> PathBuf {
    base.join(batch.date_prefix())
        .join(category)
        .join(batch.as_str())
        .join(format!("{camera}.{ext}"))
}

/// Factory producing [`FfmpegSink`]s under a common base directory.
pub struct FfmpegSinkFactory {
    base: PathBuf,
    category: String,
    spec: SinkSpec,
}

impl FfmpegSinkFactory {
    pub fn new(base: impl Into<PathBuf>, category: impl Into<String>, spec: SinkSpec) -> Self {
        FfmpegSinkFactory {
            base: base.into(),
            category: category.into(),
            spec,
        }
    }
}

impl SinkFactory for FfmpegSinkFactory {
    fn open(&self, camera: &str, batch: &BatchId) -> Result<Box<dyn VideoSink>> {
        let path = batch_output_path(&self.base, &self.category, batch, camera, "mp4");
        Ok(Box::new(FfmpegSink::open(&path, self.spec)?))
    }
}

/// Sink that feeds raw frames to an `ffmpeg` child over stdin.
pub struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    path: PathBuf,
    spec: SinkSpec,
    frames: u64,
}

impl FfmpegSink {
    pub fn open(path: &Path, spec: SinkSpec) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo"])
            .args(["-pix_fmt", spec.pixel.ffmpeg_name()])
            .args(["-s", &format!("{}x{}", spec.width, spec.height)])
            .args(["-r", &spec.fps.to_string()])
            .args(["-i", "-"])
            .args(["-an", "-vcodec", "libx264", "-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawning ffmpeg for {}", path.display()))?;

        let stdin = child.stdin.take();
        tracing::info!("Opened sink {}", path.display());
        Ok(FfmpegSink {
            child,
            stdin,
            path: path.to_path_buf(),
            spec,
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VideoSink for FfmpegSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let expected = self.spec.frame_len();
        if frame.data.len() != expected {
            anyhow::bail!(
                "frame size mismatch for {}: got {} bytes, sink expects {}",
                self.path.display(),
                frame.data.len(),
                expected
            );
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("sink already closed"))?;
        stdin
            .write_all(&frame.data)
            .with_context(|| format!("writing frame to {}", self.path.display()))?;
        self.frames += 1;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<u64> {
        // Dropping stdin ends the rawvideo stream; ffmpeg then finalizes
        // the container.
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .with_context(|| format!("waiting for ffmpeg ({})", self.path.display()))?;
        if !status.success() {
            anyhow::bail!("ffmpeg exited with {} for {}", status, self.path.display());
        }
        tracing::info!("Closed sink {} ({} frames)", self.path.display(), self.frames);
        Ok(self.frames)
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        // Normal shutdown goes through close(); this only runs on abandoned
        // sinks (write failure, panic) where a zombie would otherwise leak.
        if self.stdin.is_some() {
            drop(self.stdin.take());
            let _ = self.child.wait();
        }
    }
}

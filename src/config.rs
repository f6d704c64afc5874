//! Recorder configuration.
//!
//! Loaded from a JSON file, with CLI flags overriding individual fields.
//! Camera entries pair a stable display name with the device serial (or
//! device path) plus an ordered parameter list applied at configure time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Base directory for all recordings.
    pub output_dir: PathBuf,
    /// Subdirectory under the date prefix (`<base>/<date>/<category>/...`).
    pub category: String,
    /// Inactivity gap (seconds) that starts a new batch.
    pub min_batch_interval_secs: f64,
    /// Per-poll timeout (ms) for `FrameSource::next`.
    pub grab_timeout_ms: u64,
    /// Saver threads per camera. Keep at 1 for video sinks: a pool does not
    /// preserve frame order within one file.
    pub saver_threads_per_camera: usize,
    /// Frame rate stamped into the output containers.
    pub video_fps: u32,
    /// Expected frame geometry for the sink.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Device-buffer depth above which a backpressure warning is logged.
    pub pending_warn_threshold: usize,
    /// Consumer queue depth above which a backpressure warning is logged.
    pub queue_warn_depth: usize,
    /// Free-space floor (GB) for disk warnings.
    pub min_free_gb: f64,
    /// Cameras to record; devices not listed here are ignored.
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Device serial number or device path used to find the camera.
    pub serial: String,
    /// Stable name used in output paths and logs (e.g. "camTL").
    pub name: String,
    /// Dotted-path parameters applied in order at configure time. Order
    /// matters for gated parameters (trigger mode off, trigger source,
    /// trigger mode on).
    #[serde(default)]
    pub params: Vec<(String, String)>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            output_dir: PathBuf::from("recordings"),
            category: "cameras".to_string(),
            min_batch_interval_secs: 1.0,
            grab_timeout_ms: 100,
            saver_threads_per_camera: 1,
            video_fps: 10,
            frame_width: 960,
            frame_height: 960,
            pending_warn_threshold: 10,
            queue_warn_depth: 50,
            min_free_gb: 100.0,
            cameras: Vec::new(),
        }
    }
}

impl RecorderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn min_batch_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_batch_interval_secs.max(0.0))
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }
}

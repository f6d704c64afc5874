//! Multi-camera hardware-triggered capture pipeline.
//!
//! Cameras all fire on a shared external trigger, so frames arrive in bursts.
//! A gap in the trigger signal starts a new *batch*; each batch is saved as
//! one video file per camera under a timestamped directory. Acquisition and
//! saving run on dedicated threads per camera, connected by unbounded queues,
//! and shut down in order on cancellation so no accepted frame is lost.

pub mod acquisition;
pub mod batch;
pub mod config;
pub mod disk;
pub mod fanout;
pub mod frame;
pub mod orchestrator;
pub mod saver;
pub mod sink;
pub mod source;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch::{BatchId, BatchTracker};
pub use config::{CameraConfig, RecorderConfig};
pub use frame::{Frame, QueueEntry};
pub use orchestrator::{Orchestrator, SessionReport};
pub use sink::{FfmpegSinkFactory, PixelLayout, SinkFactory, SinkSpec, VideoSink};
pub use source::{FramePoll, FrameSource, SyntheticSource};

#[cfg(feature = "camera")]
pub use source::v4l2::{list_cameras, CameraInfo, V4l2Source};

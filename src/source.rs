//! Frame sources.
//!
//! [`FrameSource`] is the boundary to one camera device. The pipeline never
//! talks to vendor APIs directly; acquisition workers drive a source through
//! `begin` / `next` / `end` and treat everything behind it as opaque.
//!
//! Two implementations ship with the crate: [`SyntheticSource`] generates
//! trigger-like frame bursts for running the pipeline without hardware, and
//! `V4l2Source` (behind the `camera` feature) captures from local V4L2
//! devices.

use std::time::{Duration, SystemTime};

use anyhow::Result;
use bytes::Bytes;

/// One frame as it comes off the device, before batch tagging.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub timestamp: SystemTime,
}

/// Outcome of one bounded-wait poll.
///
/// `Timeout` is not an error: hardware-triggered cameras produce nothing
/// between trigger trains and the caller simply re-polls. `Incomplete` means
/// the device delivered a partial transfer; the frame is dropped and the
/// stream continues. Fatal device errors are reported through `Err(_)` from
/// [`FrameSource::next`] and stop that camera only.
#[derive(Debug)]
pub enum FramePoll {
    Captured(CapturedFrame),
    Timeout,
    Incomplete,
}

/// Abstraction over one streaming camera device.
pub trait FrameSource: Send {
    /// Stable camera name used in output paths and logs.
    fn name(&self) -> &str;

    /// Apply dotted-path parameters in the given order.
    ///
    /// Order is significant: some device parameters are gated by others
    /// (trigger mode must be off to change the trigger source, then
    /// re-enabled), so the list is applied exactly as written.
    fn configure(&mut self, params: &[(String, String)]) -> Result<()>;

    /// Start the underlying stream.
    fn begin(&mut self) -> Result<()>;

    /// Block up to `timeout` for the next frame.
    ///
    /// The returned buffer must remain valid after the call; implementations
    /// copy out of any device-owned memory before returning.
    fn next(&mut self, timeout: Duration) -> Result<FramePoll>;

    /// Stop the stream and release device-side resources.
    fn end(&mut self) -> Result<()>;

    /// Number of frames waiting in the device-side buffer, if the device
    /// exposes it. Used for backpressure diagnostics only.
    fn pending_count(&self) -> usize {
        0
    }
}

/// Synthetic frame source producing gradient frames in timed bursts.
///
/// Emits `fps` frames per second for `burst` seconds, then goes silent for
/// `idle` seconds, mimicking a hardware trigger train that starts and stops
/// between trials. With `idle` zero it streams continuously.
pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_interval: Duration,
    burst: Duration,
    idle: Duration,
    started_at: Option<std::time::Instant>,
    frames_emitted: u64,
}

impl SyntheticSource {
    pub fn new(name: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        SyntheticSource {
            name: name.into(),
            width,
            height,
            frame_interval: Duration::from_secs(1) / fps.max(1),
            burst: Duration::from_secs(2),
            idle: Duration::ZERO,
            started_at: None,
            frames_emitted: 0,
        }
    }

    /// Configure the burst/idle cycle.
    pub fn with_cycle(mut self, burst: Duration, idle: Duration) -> Self {
        self.burst = burst;
        self.idle = idle;
        self
    }

    fn render(&self, seq: u64) -> Bytes {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut data = vec![0u8; w * h];
        // Moving diagonal gradient so consecutive frames differ.
        for y in 0..h {
            for x in 0..w {
                data[y * w + x] = ((x + y + seq as usize) % 256) as u8;
            }
        }
        Bytes::from(data)
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, _params: &[(String, String)]) -> Result<()> {
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.started_at = Some(std::time::Instant::now());
        self.frames_emitted = 0;
        Ok(())
    }

    fn next(&mut self, timeout: Duration) -> Result<FramePoll> {
        let started = match self.started_at {
            Some(s) => s,
            None => anyhow::bail!("synthetic source polled before begin()"),
        };
        let cycle = self.burst + self.idle;
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let in_burst = if self.idle.is_zero() {
                true
            } else {
                let into_cycle =
                    Duration::from_nanos((started.elapsed().as_nanos() % cycle.as_nanos()) as u64);
                into_cycle < self.burst
            };
            if in_burst {
                std::thread::sleep(self.frame_interval);
                self.frames_emitted += 1;
                let data = self.render(self.frames_emitted);
                return Ok(FramePoll::Captured(CapturedFrame {
                    data,
                    width: self.width,
                    height: self.height,
                    timestamp: SystemTime::now(),
                }));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(FramePoll::Timeout);
            }
            std::thread::sleep(Duration::from_millis(5).min(deadline.saturating_duration_since(now)));
        }
    }

    fn end(&mut self) -> Result<()> {
        self.started_at = None;
        Ok(())
    }
}

#[cfg(feature = "camera")]
pub use v4l2::{list_cameras, CameraInfo, V4l2Source};

#[cfg(feature = "camera")]
pub mod v4l2 {
    use super::{CapturedFrame, FramePoll, FrameSource};
    use anyhow::{Context, Result};
    use bytes::Bytes;
    use std::os::fd::AsRawFd;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;
    use v4l::{Device, FourCC};

    /// A V4L2 device found during discovery.
    #[derive(Debug, Clone)]
    pub struct CameraInfo {
        pub path: PathBuf,
        pub card: String,
    }

    /// Enumerate `/dev/video*` capture devices.
    pub fn list_cameras() -> Result<Vec<CameraInfo>> {
        let mut cameras = Vec::new();
        for entry in std::fs::read_dir("/dev")? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("video") || name[5..].parse::<u32>().is_err() {
                continue;
            }
            let card = match Device::with_path(&path) {
                Ok(dev) => dev
                    .query_caps()
                    .map(|c| c.card)
                    .unwrap_or_else(|_| name.to_string()),
                Err(_) => continue,
            };
            cameras.push(CameraInfo { path, card });
        }
        cameras.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(cameras)
    }

    enum Negotiated {
        Grey,
        Yuyv,
        Mjpeg,
    }

    /// Local V4L2 capture source producing 8-bit grayscale frames.
    ///
    /// MJPEG and YUYV streams are reduced to luma on the way out; the
    /// recording pipeline downstream is grayscale end to end.
    pub struct V4l2Source {
        name: String,
        // Leaked so the mmap stream can borrow it for 'static; one device
        // per recording session, released when the process exits.
        device: &'static Device,
        stream: Option<Stream<'static>>,
        format: Negotiated,
        width: u32,
        height: u32,
    }

    // Safe: the device is only ever driven from the camera's own
    // acquisition thread.
    unsafe impl Send for V4l2Source {}

    impl V4l2Source {
        pub fn open(name: impl Into<String>, path: &std::path::Path, width: u32, height: u32) -> Result<Self> {
            let device: &'static Device = Box::leak(Box::new(
                Device::with_path(path).with_context(|| format!("opening {}", path.display()))?,
            ));
            let mut fmt = device.format()?;
            fmt.width = width;
            fmt.height = height;

            // Preference order: native grayscale, YUYV (luma extraction is
            // free), MJPEG (decode cost).
            let mut negotiated = None;
            for (fourcc, kind) in [
                (FourCC::new(b"GREY"), Negotiated::Grey),
                (FourCC::new(b"YUYV"), Negotiated::Yuyv),
                (FourCC::new(b"MJPG"), Negotiated::Mjpeg),
            ] {
                fmt.fourcc = fourcc;
                if let Ok(actual) = device.set_format(&fmt) {
                    if actual.fourcc == fourcc {
                        fmt = actual;
                        negotiated = Some(kind);
                        break;
                    }
                }
            }
            let format =
                negotiated.ok_or_else(|| anyhow::anyhow!("no usable pixel format on {}", path.display()))?;

            Ok(V4l2Source {
                name: name.into(),
                device,
                stream: None,
                format,
                width: fmt.width,
                height: fmt.height,
            })
        }

        pub fn width(&self) -> u32 {
            self.width
        }

        pub fn height(&self) -> u32 {
            self.height
        }

        /// poll(2) the device fd so `next` honors its bounded wait even when
        /// no trigger arrives.
        fn wait_readable(&self, timeout: Duration) -> Result<bool> {
            let mut fds = [libc::pollfd {
                fd: self.device.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            }];
            let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, millis) };
            if rc < 0 {
                return Err(std::io::Error::last_os_error()).context("poll on video device");
            }
            Ok(rc > 0 && fds[0].revents & libc::POLLIN != 0)
        }

        fn to_luma(&self, raw: &[u8]) -> Result<Option<Bytes>> {
            let w = self.width as usize;
            let h = self.height as usize;
            match self.format {
                Negotiated::Grey => {
                    if raw.len() < w * h {
                        return Ok(None);
                    }
                    Ok(Some(Bytes::copy_from_slice(&raw[..w * h])))
                }
                Negotiated::Yuyv => {
                    if raw.len() < w * h * 2 {
                        return Ok(None);
                    }
                    let mut luma = vec![0u8; w * h];
                    for (i, px) in luma.iter_mut().enumerate() {
                        *px = raw[i * 2];
                    }
                    Ok(Some(Bytes::from(luma)))
                }
                Negotiated::Mjpeg => {
                    let img = image::load_from_memory(raw).context("decoding MJPEG frame")?;
                    Ok(Some(Bytes::from(img.to_luma8().into_raw())))
                }
            }
        }
    }

    impl FrameSource for V4l2Source {
        fn name(&self) -> &str {
            &self.name
        }

        fn configure(&mut self, params: &[(String, String)]) -> Result<()> {
            // V4L2 exposes controls by name; apply in the order given so
            // gated parameters work the way vendor SDKs require.
            for (key, value) in params {
                let ctrls = self.device.query_controls()?;
                let Some(desc) = ctrls.iter().find(|c| c.name.eq_ignore_ascii_case(key)) else {
                    anyhow::bail!("camera {}: unknown control '{}'", self.name, key);
                };
                let parsed: i64 = value
                    .parse()
                    .with_context(|| format!("control '{}' value '{}'", key, value))?;
                self.device
                    .set_control(v4l::Control {
                        id: desc.id,
                        value: v4l::control::Value::Integer(parsed),
                    })
                    .with_context(|| format!("setting control '{}'", key))?;
            }
            Ok(())
        }

        fn begin(&mut self) -> Result<()> {
            self.stream = Some(Stream::with_buffers(self.device, Type::VideoCapture, 4)?);
            Ok(())
        }

        fn next(&mut self, timeout: Duration) -> Result<FramePoll> {
            if !self.wait_readable(timeout)? {
                return Ok(FramePoll::Timeout);
            }
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("stream not started"))?;
            let (raw, _meta) = stream.next()?;
            let timestamp = SystemTime::now();
            match self.to_luma(raw)? {
                Some(data) => Ok(FramePoll::Captured(CapturedFrame {
                    data,
                    width: self.width,
                    height: self.height,
                    timestamp,
                })),
                None => Ok(FramePoll::Incomplete),
            }
        }

        fn end(&mut self) -> Result<()> {
            self.stream = None;
            Ok(())
        }
    }
}

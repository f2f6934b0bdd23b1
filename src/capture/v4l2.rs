//! V4L2 capture backend with mmap streaming

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::unistd::{access, AccessFlags};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::backend::{CaptureBackend, CaptureDevice, CaptureSession, PermissionGate};
use super::decoder::decode_to_rgb;
use super::device::{CaptureEncoding, DeviceDescriptor, Resolution};
use super::frame::{Frame, PixelFormat};
use super::pool::BufferPool;
use crate::error::{PipelineError, Result};

/// Device nodes probed when no explicit path is configured.
const MAX_NODES: u32 = 10;

/// Bounded dequeue wait so the capture loop notices close promptly.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Pixel formats we can decode, most preferred first.
const ENCODING_PREFERENCE: [(&[u8; 4], CaptureEncoding); 3] = [
    (b"MJPG", CaptureEncoding::Mjpeg),
    (b"YUYV", CaptureEncoding::Yuyv),
    (b"RGB3", CaptureEncoding::Rgb24),
];

fn fourcc_for(encoding: CaptureEncoding) -> FourCC {
    match encoding {
        CaptureEncoding::Mjpeg => FourCC::new(b"MJPG"),
        CaptureEncoding::Yuyv => FourCC::new(b"YUYV"),
        CaptureEncoding::Rgb24 => FourCC::new(b"RGB3"),
    }
}

/// Best decodable format among those a device offers.
fn preferred_encoding(offered: &[FourCC]) -> Option<(FourCC, CaptureEncoding)> {
    ENCODING_PREFERENCE
        .iter()
        .map(|(code, encoding)| (FourCC::new(code), *encoding))
        .find(|(fourcc, _)| offered.contains(fourcc))
}

/// Capture from `/dev/video*` nodes.
pub struct V4l2Backend {
    device_path: Option<String>,
    buffer_count: u32,
}

impl V4l2Backend {
    /// `device_path` pins a single node; otherwise `/dev/video0..9` are probed.
    pub fn new(device_path: Option<String>, buffer_count: u32) -> Self {
        Self {
            device_path: device_path.filter(|p| !p.is_empty()),
            buffer_count: buffer_count.max(2),
        }
    }

    fn candidate_paths(&self) -> Vec<String> {
        match &self.device_path {
            Some(path) => vec![path.clone()],
            None => (0..MAX_NODES).map(|i| format!("/dev/video{i}")).collect(),
        }
    }

    /// Granted when every present candidate node is readable and writable.
    ///
    /// With no nodes at all the gate stays open so enumeration can report
    /// the missing device instead.
    pub fn permission_gate(&self) -> impl PermissionGate {
        let paths = self.candidate_paths();
        move || {
            paths
                .iter()
                .filter(|p| Path::new(p.as_str()).exists())
                .all(|p| access(p.as_str(), AccessFlags::R_OK | AccessFlags::W_OK).is_ok())
        }
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    #[instrument(skip(self))]
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices: Vec<_> = self
            .candidate_paths()
            .into_iter()
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| probe(&path))
            .collect();
        Ok(devices)
    }

    fn open_device(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn CaptureDevice>> {
        let device = Device::with_path(&descriptor.id)
            .map_err(|e| PipelineError::DeviceUnavailable(format!("{}: {e}", descriptor.id)))?;
        info!(device = %descriptor.id, name = %descriptor.name, "V4L2 device opened");

        Ok(Box::new(V4l2Device {
            id: descriptor.id.clone(),
            device: Some(device),
            encoding: descriptor.encoding,
            buffer_count: self.buffer_count,
        }))
    }
}

/// Query one node; `None` if it is not a usable capture device.
fn probe(path: &str) -> Option<DeviceDescriptor> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        return None;
    }

    let offered: Vec<FourCC> = dev
        .enum_formats()
        .ok()?
        .into_iter()
        .map(|f| f.fourcc)
        .collect();
    let (fourcc, encoding) = preferred_encoding(&offered)?;

    let resolutions = dev
        .enum_framesizes(fourcc)
        .map(|sizes| {
            sizes
                .into_iter()
                .map(|size| match size.size {
                    FrameSizeEnum::Discrete(d) => Resolution::new(d.width, d.height),
                    FrameSizeEnum::Stepwise(s) => Resolution::new(s.max_width, s.max_height),
                })
                .collect()
        })
        .unwrap_or_default();

    debug!(path, card = %caps.card, ?encoding, "found capture device");
    Some(DeviceDescriptor {
        id: path.to_string(),
        name: caps.card,
        encoding,
        resolutions,
    })
}

struct V4l2Device {
    id: String,
    device: Option<Device>,
    encoding: CaptureEncoding,
    buffer_count: u32,
}

impl CaptureDevice for V4l2Device {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_session(
        &mut self,
        resolution: Resolution,
        pool: BufferPool,
    ) -> Result<Box<dyn CaptureSession>> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| PipelineError::SessionConfigurationFailed("device closed".into()))?;
        let config_err = |e: io::Error| PipelineError::SessionConfigurationFailed(e.to_string());

        let fourcc = fourcc_for(self.encoding);

        let mut fmt = device.format().map_err(config_err)?;
        fmt.width = resolution.width;
        fmt.height = resolution.height;
        fmt.fourcc = fourcc;
        let actual = device.set_format(&fmt).map_err(config_err)?;
        if actual.fourcc != fourcc {
            return Err(PipelineError::SessionConfigurationFailed(format!(
                "driver refused {fourcc}, offered {}",
                actual.fourcc
            )));
        }

        let mut stream = MmapStream::with_buffers(device, Type::VideoCapture, self.buffer_count)
            .map_err(config_err)?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        info!(
            device = %self.id,
            width = actual.width,
            height = actual.height,
            buffers = self.buffer_count,
            "capture session configured"
        );

        Ok(Box::new(V4l2Session {
            stream: Some(stream),
            pool,
            encoding: self.encoding,
            width: actual.width,
            height: actual.height,
            sequence: 0,
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.device.take();
        Ok(())
    }
}

struct V4l2Session {
    stream: Option<MmapStream<'static>>,
    pool: BufferPool,
    encoding: CaptureEncoding,
    width: u32,
    height: u32,
    sequence: u64,
}

impl CaptureSession for V4l2Session {
    fn start_repeating(&mut self) -> Result<()> {
        // The mmap stream queues its buffers and issues STREAMON on the
        // first dequeue, so there is nothing to do up front.
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            Stream::stop(stream).map_err(|e| PipelineError::DeviceDisconnected(e.to_string()))?;
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let timestamp = Instant::now();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PipelineError::DeviceDisconnected("stream closed".into()))?;

        let (buf, meta) = match CaptureStream::next(stream) {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => return Err(PipelineError::DeviceDisconnected(e.to_string())),
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let mut out = self
            .pool
            .acquire(self.width as usize * self.height as usize * 3);
        let (width, height) =
            match decode_to_rgb(&buf[..used], self.encoding, self.width, self.height, out.vec_mut())
            {
                Ok(dims) => dims,
                Err(e) => {
                    warn!("dropping undecodable frame: {e}");
                    return Ok(None);
                }
            };

        self.sequence += 1;
        let mut frame =
            Frame::packed(width, height, PixelFormat::Rgb24, out).with_sequence(self.sequence);
        frame.timestamp = timestamp;
        frame.device_timestamp = Some(
            Duration::from_secs(meta.timestamp.sec as u64)
                + Duration::from_micros(meta.timestamp.usec as u64),
        );
        Ok(Some(frame))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the stream unmaps its buffers
        self.stream.take();
        Ok(())
    }
}

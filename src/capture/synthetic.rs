//! Test-pattern camera for machines without capture hardware.

use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use super::backend::{CaptureBackend, CaptureDevice, CaptureSession};
use super::device::{CaptureEncoding, DeviceDescriptor, Resolution};
use super::frame::{Frame, PixelFormat};
use super::pool::BufferPool;
use crate::error::Result;

const DEVICE_ID: &str = "synthetic:0";

/// Longest single wait inside `next_frame`, so the capture loop stays
/// responsive to close.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A single fake camera producing a scrolling RGB gradient.
pub struct SyntheticBackend {
    fps: u32,
    resolutions: Vec<Resolution>,
}

impl SyntheticBackend {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            resolutions: vec![
                Resolution::new(640, 480),
                Resolution::new(1280, 720),
                Resolution::new(1920, 1080),
            ],
        }
    }

    pub fn with_resolutions(mut self, resolutions: Vec<Resolution>) -> Self {
        self.resolutions = resolutions;
        self
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(vec![DeviceDescriptor {
            id: DEVICE_ID.to_string(),
            name: "Synthetic Test Pattern".to_string(),
            encoding: CaptureEncoding::Rgb24,
            resolutions: self.resolutions.clone(),
        }])
    }

    fn open_device(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureDevice>> {
        info!(device = %device.id, "opening synthetic camera");
        Ok(Box::new(SyntheticDevice {
            id: device.id.clone(),
            interval: Duration::from_secs(1) / self.fps,
        }))
    }
}

struct SyntheticDevice {
    id: String,
    interval: Duration,
}

impl CaptureDevice for SyntheticDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_session(
        &mut self,
        resolution: Resolution,
        pool: BufferPool,
    ) -> Result<Box<dyn CaptureSession>> {
        Ok(Box::new(SyntheticSession {
            resolution,
            pool,
            interval: self.interval,
            next_due: Instant::now(),
            epoch: Instant::now(),
            sequence: 0,
            repeating: false,
        }))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct SyntheticSession {
    resolution: Resolution,
    pool: BufferPool,
    interval: Duration,
    next_due: Instant,
    epoch: Instant,
    sequence: u64,
    repeating: bool,
}

impl SyntheticSession {
    fn render(&mut self) -> Frame {
        let Resolution { width, height } = self.resolution;
        let offset = self.sequence as usize * 2;

        let mut buf = self.pool.acquire(width as usize * height as usize * 3);
        let data = buf.vec_mut();
        for y in 0..height as usize {
            for x in 0..width as usize {
                data.extend_from_slice(&[
                    ((x + offset) % 256) as u8,
                    ((y + offset) % 256) as u8,
                    (offset % 256) as u8,
                ]);
            }
        }

        let mut frame = Frame::packed(width, height, PixelFormat::Rgb24, buf)
            .with_sequence(self.sequence);
        frame.device_timestamp = Some(self.epoch.elapsed());
        frame
    }
}

impl CaptureSession for SyntheticSession {
    fn start_repeating(&mut self) -> Result<()> {
        self.repeating = true;
        self.next_due = Instant::now();
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<()> {
        self.repeating = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.repeating {
            thread::sleep(POLL_INTERVAL);
            return Ok(None);
        }

        let now = Instant::now();
        if now < self.next_due {
            thread::sleep((self.next_due - now).min(POLL_INTERVAL));
            if Instant::now() < self.next_due {
                return Ok(None);
            }
        }

        self.sequence += 1;
        self.next_due += self.interval;
        Ok(Some(self.render()))
    }

    fn close(&mut self) -> Result<()> {
        self.repeating = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_sequenced_frames_of_the_session_size() {
        let backend = SyntheticBackend::new(1000);
        let devices = backend.enumerate().unwrap();
        let mut device = backend.open_device(&devices[0]).unwrap();
        let pool = BufferPool::new(2);
        let mut session = device
            .create_session(Resolution::new(8, 4), pool.clone())
            .unwrap();

        assert!(session.next_frame().unwrap().is_none(), "not started yet");
        session.start_repeating().unwrap();

        let mut frames = Vec::new();
        while frames.len() < 2 {
            if let Some(frame) = session.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames[0].sequence, 1);
        assert_eq!(frames[1].sequence, 2);
        assert_eq!((frames[0].width, frames[0].height), (8, 4));
        assert_eq!(frames[0].data().len(), 8 * 4 * 3);
        assert_eq!(pool.outstanding(), 2);

        drop(frames);
        assert_eq!(pool.outstanding(), 0);
    }
}

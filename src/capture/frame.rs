use std::borrow::Cow;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::pool::FrameBuffer;

/// Decoded pixel layouts a frame can carry.
///
/// Device encodings (MJPEG, YUYV) never leave the capture thread; they are
/// decoded into one of these first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Rgba32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 => 4,
        }
    }

    pub fn channels(self) -> usize {
        self.bytes_per_pixel()
    }
}

/// One plane of image data.
#[derive(Debug)]
pub struct Plane {
    pub data: FrameBuffer,
    pub bytes_per_row: usize,
}

/// A captured (or transformed) image.
///
/// Frames are moved between stages, never cloned. Dropping a frame hands its
/// buffers back to the pool they came from.
#[derive(Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Plane>,

    /// Per-session capture counter, starting at 1
    pub sequence: u64,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,

    /// Hardware timestamp if available
    pub device_timestamp: Option<Duration>,
}

impl Frame {
    /// Single-plane frame with tightly packed rows.
    pub fn packed(width: u32, height: u32, format: PixelFormat, data: FrameBuffer) -> Self {
        Self {
            width,
            height,
            format,
            planes: vec![Plane {
                data,
                bytes_per_row: width as usize * format.bytes_per_pixel(),
            }],
            sequence: 0,
            timestamp: Instant::now(),
            device_timestamp: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Bytes of the first plane.
    pub fn data(&self) -> &[u8] {
        self.planes.first().map(|p| &p.data[..]).unwrap_or(&[])
    }

    pub fn bytes_per_row(&self) -> usize {
        self.planes
            .first()
            .map(|p| p.bytes_per_row)
            .unwrap_or(self.width as usize * self.format.bytes_per_pixel())
    }

    /// Pixels as tightly packed RGBA8, borrowing when no conversion is needed.
    ///
    /// Rows missing from a short buffer come out black.
    pub fn to_rgba(&self) -> Cow<'_, [u8]> {
        let width = self.width as usize;
        let height = self.height as usize;
        let expected = width * height * 4;
        let stride = self.bytes_per_row();
        let data = self.data();

        if self.format == PixelFormat::Rgba32 && stride == width * 4 && data.len() >= expected {
            return Cow::Borrowed(&data[..expected]);
        }

        let bpp = self.format.bytes_per_pixel();
        let mut rgba = Vec::with_capacity(expected);
        for row in 0..height {
            let start = row * stride;
            let Some(line) = data.get(start..start + width * bpp) else {
                break;
            };
            match self.format {
                PixelFormat::Gray8 => {
                    for &y in line {
                        rgba.extend_from_slice(&[y, y, y, 255]);
                    }
                }
                PixelFormat::Rgb24 => {
                    for px in line.chunks_exact(3) {
                        rgba.extend_from_slice(&[px[0], px[1], px[2], 255]);
                    }
                }
                PixelFormat::Rgba32 => rgba.extend_from_slice(line),
            }
        }
        rgba.resize(expected, 0);
        Cow::Owned(rgba)
    }
}

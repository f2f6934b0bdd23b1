//! Injected per-frame transform capability.

use thiserror::Error;

use crate::capture::{Frame, PixelFormat};

#[derive(Debug, Clone, Error)]
pub enum TransformError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("transform failed: {0}")]
    Failed(String),
}

/// A failed transform hands the untouched input frame back to the caller.
#[derive(Debug)]
pub struct Rejected {
    pub frame: Frame,
    pub error: TransformError,
}

impl Rejected {
    pub fn new(frame: Frame, error: TransformError) -> Self {
        Self { frame, error }
    }
}

pub type TransformResult = std::result::Result<Frame, Rejected>;

/// Frame in, frame out. Runs synchronously on the render thread, so it has
/// roughly one display interval to finish.
pub trait Transform: Send {
    fn transform(&mut self, frame: Frame) -> TransformResult;
}

impl<F> Transform for F
where
    F: FnMut(Frame) -> TransformResult + Send,
{
    fn transform(&mut self, frame: Frame) -> TransformResult {
        self(frame)
    }
}

/// Reduces colour frames to a single luminance channel (BT.601 weights).
#[derive(Debug, Default, Clone, Copy)]
pub struct Luma;

impl Transform for Luma {
    fn transform(&mut self, frame: Frame) -> TransformResult {
        let bpp = match frame.format {
            PixelFormat::Rgb24 | PixelFormat::Rgba32 => frame.format.bytes_per_pixel(),
            other => return Err(Rejected::new(frame, TransformError::UnsupportedFormat(other))),
        };

        let width = frame.width as usize;
        let height = frame.height as usize;
        let stride = frame.bytes_per_row();
        let data = frame.data();
        if data.len() < stride * height.saturating_sub(1) + width * bpp {
            let msg = format!("{} bytes for {}x{} frame", data.len(), width, height);
            return Err(Rejected::new(frame, TransformError::Failed(msg)));
        }

        let mut gray = Vec::with_capacity(width * height);
        for row in 0..height {
            let line = &data[row * stride..row * stride + width * bpp];
            gray.extend(line.chunks_exact(bpp).map(|px| {
                let y = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
                (y / 1000) as u8
            }));
        }

        let mut out = Frame::packed(frame.width, frame.height, PixelFormat::Gray8, gray.into());
        out.sequence = frame.sequence;
        out.timestamp = frame.timestamp;
        out.device_timestamp = frame.device_timestamp;
        Ok(out)
    }
}

use thiserror::Error;

use crate::capture::device::CaptureEncoding;

/// A single device buffer that could not be decoded.
#[derive(Debug, Error)]
#[error("{encoding:?} decode failed: {message}")]
pub struct DecodeError {
    pub encoding: CaptureEncoding,
    pub message: String,
}

/// Decode one device buffer into tightly packed RGB24, appending to `out`.
///
/// Returns the decoded `(width, height)`, which for MJPEG comes from the
/// bitstream rather than the negotiated format.
pub fn decode_to_rgb(
    data: &[u8],
    encoding: CaptureEncoding,
    width: u32,
    height: u32,
    out: &mut Vec<u8>,
) -> Result<(u32, u32), DecodeError> {
    match encoding {
        CaptureEncoding::Mjpeg => {
            let failed = |message: String| DecodeError { encoding, message };
            let mut decoder = zune_jpeg::JpegDecoder::new(data);
            decoder.decode_headers().map_err(|e| failed(format!("{e:?}")))?;
            let (w, h) = decoder
                .dimensions()
                .map(|(w, h)| (w as u32, h as u32))
                .unwrap_or((width, height));
            let size = decoder
                .output_buffer_size()
                .ok_or_else(|| failed("unknown output size".into()))?;

            // Decode straight into the pooled buffer
            let start = out.len();
            out.resize(start + size, 0);
            if let Err(e) = decoder.decode_into(&mut out[start..]) {
                out.truncate(start);
                return Err(failed(format!("{e:?}")));
            }
            Ok((w, h))
        }
        CaptureEncoding::Rgb24 => {
            let len = (width * height * 3) as usize;
            out.extend_from_slice(&data[..len.min(data.len())]);
            Ok((width, height))
        }
        CaptureEncoding::Yuyv => {
            yuyv_to_rgb(data, out);
            Ok((width, height))
        }
    }
}

/// YUYV 4:2:2 to RGB24 using BT.601 limited-range integer coefficients.
fn yuyv_to_rgb(data: &[u8], out: &mut Vec<u8>) {
    out.reserve(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        push_rgb(out, y0, u, v);
        push_rgb(out, y1, u, v);
    }
}

fn push_rgb(out: &mut Vec<u8>, y: u8, u: u8, v: u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    out.push(clamp(298 * c + 409 * e));
    out.push(clamp(298 * c - 100 * d - 208 * e));
    out.push(clamp(298 * c + 516 * d));
}

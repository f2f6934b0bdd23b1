//! Device discovery and output-size selection.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::backend::CaptureBackend;
use crate::error::{PipelineError, Result};

/// Output size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exact aspect-ratio match, compared by cross-multiplication.
    pub fn same_aspect(self, other: Resolution) -> bool {
        self.height as u64 * other.width as u64 == other.height as u64 * self.width as u64
    }

    /// At least as large as `other` in both dimensions.
    pub fn covers(self, other: Resolution) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Wire encoding a device delivers before it is decoded on the capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureEncoding {
    Mjpeg,
    Yuyv,
    Rgb24,
}

/// What enumeration learned about one capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub encoding: CaptureEncoding,
    /// Advertised output sizes, in the order the device reported them
    pub resolutions: Vec<Resolution>,
}

/// Pick the output size for `target` out of `supported`.
///
/// Prefers the smallest (by area) size that covers the target with exactly
/// the target's aspect ratio; the first such size wins ties. Falls back to
/// the first advertised size. `None` only when `supported` is empty.
pub fn choose_resolution(supported: &[Resolution], target: Resolution) -> Option<Resolution> {
    supported
        .iter()
        .copied()
        .filter(|size| size.covers(target) && size.same_aspect(target))
        .min_by_key(|size| size.area())
        .or_else(|| supported.first().copied())
}

/// Queries a backend for devices and settles on one device and output size.
pub struct DeviceEnumerator<'a> {
    backend: &'a dyn CaptureBackend,
}

impl<'a> DeviceEnumerator<'a> {
    pub fn new(backend: &'a dyn CaptureBackend) -> Self {
        Self { backend }
    }

    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = self.backend.enumerate()?;
        debug!(count = devices.len(), "enumerated capture devices");
        Ok(devices)
    }

    /// First enumerated device plus the nearest-fit size for `target`.
    pub fn select(&self, target: Resolution) -> Result<(DeviceDescriptor, Resolution)> {
        let device = self
            .devices()?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::DeviceUnavailable("no capture devices enumerated".into()))?;

        let usable: Vec<Resolution> = device
            .resolutions
            .iter()
            .copied()
            .filter(|r| !r.is_empty())
            .collect();

        let chosen = choose_resolution(&usable, target).ok_or_else(|| {
            PipelineError::ConfigurationError(format!("{} advertises no output sizes", device.id))
        })?;

        info!(device = %device.id, %target, %chosen, "selected capture resolution");
        Ok((device, chosen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(list: &[(u32, u32)]) -> Vec<Resolution> {
        list.iter().map(|&(w, h)| Resolution::new(w, h)).collect()
    }

    #[test]
    fn exact_match_is_chosen() {
        let supported = sizes(&[(640, 480), (1280, 720), (1920, 1080)]);
        let chosen = choose_resolution(&supported, Resolution::new(1280, 720));
        assert_eq!(chosen, Some(Resolution::new(1280, 720)));
    }

    #[test]
    fn no_aspect_match_falls_back_to_first() {
        let supported = sizes(&[(800, 600)]);
        let chosen = choose_resolution(&supported, Resolution::new(1280, 720));
        assert_eq!(chosen, Some(Resolution::new(800, 600)));
    }

    #[test]
    fn smallest_covering_size_wins() {
        let supported = sizes(&[(3840, 2160), (640, 360), (1920, 1080), (2560, 1440)]);
        let chosen = choose_resolution(&supported, Resolution::new(1280, 720));
        assert_eq!(chosen, Some(Resolution::new(1920, 1080)));
    }

    #[test]
    fn target_larger_than_every_size_falls_back_to_first() {
        let supported = sizes(&[(1280, 720), (640, 360)]);
        let chosen = choose_resolution(&supported, Resolution::new(3840, 2160));
        assert_eq!(chosen, Some(Resolution::new(1280, 720)));
    }

    #[test]
    fn selection_is_deterministic() {
        let supported = sizes(&[(1920, 1080), (640, 480), (1280, 720), (960, 540)]);
        let target = Resolution::new(960, 540);
        let results: Vec<_> = (0..10)
            .map(|_| choose_resolution(&supported, target))
            .collect();
        assert!(results.iter().all(|r| *r == Some(Resolution::new(960, 540))));
    }

    #[test]
    fn empty_list_yields_none() {
        assert_eq!(choose_resolution(&[], Resolution::new(1280, 720)), None);
    }

    #[test]
    fn aspect_comparison_is_exact() {
        // 1366x768 is close to but not exactly 16:9
        assert!(!Resolution::new(1366, 768).same_aspect(Resolution::new(1280, 720)));
        assert!(Resolution::new(1920, 1080).same_aspect(Resolution::new(1280, 720)));
    }
}

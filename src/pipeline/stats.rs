//! Render-side counters shared with whoever wants to display them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

/// Frames observed by the presenter and the time spent processing them.
///
/// Written by the render thread, sampled by anyone on any cadence.
#[derive(Default)]
pub struct RenderStats {
    frames: CachePadded<AtomicU64>,
    processing_nanos: AtomicU64,
    transform_failures: AtomicU64,
    texture_recreations: AtomicU64,
    rate: Mutex<FrameRate>,
}

#[derive(Default)]
struct FrameRate {
    fps: f64,
    last: Option<Instant>,
}

/// Point-in-time copy of [`RenderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub total_processing: Duration,
    pub transform_failures: u64,
    pub texture_recreations: u64,
    /// Exponentially smoothed frames per second
    pub fps: f64,
}

impl StatsSnapshot {
    pub fn average_processing(&self) -> Duration {
        if self.frames == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_processing.as_nanos() / self.frames as u128;
        Duration::from_nanos(nanos as u64)
    }
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one observed frame that took `elapsed` to process.
    pub fn record_frame(&self, elapsed: Duration) {
        self.record_frame_at(elapsed, Instant::now());
    }

    fn record_frame_at(&self, elapsed: Duration, now: Instant) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.processing_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);

        let mut rate = self.rate.lock();
        if let Some(last) = rate.last {
            let interval = now.saturating_duration_since(last).as_secs_f64();
            if interval > 0.0 {
                rate.fps = 0.9 * rate.fps + 0.1 * (1.0 / interval);
            }
        }
        rate.last = Some(now);
    }

    pub fn record_transform_failure(&self) {
        self.transform_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_texture_recreation(&self) {
        self.texture_recreations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            total_processing: Duration::from_nanos(self.processing_nanos.load(Ordering::Relaxed)),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            texture_recreations: self.texture_recreations.load(Ordering::Relaxed),
            fps: self.rate.lock().fps,
        }
    }
}

//! Lock-free single-slot frame hand-off

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use tracing::warn;

use crate::capture::Frame;

/// Latest-wins hand-off between the capture thread and the render thread.
///
/// Holds at most one frame. Publishing over an unconsumed frame releases the
/// older one before `publish` returns; neither side ever waits on the other.
pub struct FrameBridge {
    /// Only ever accessed through `swap`, so the `Arc` in the slot is never
    /// shared and can always be unwrapped by whoever swaps it out.
    slot: ArcSwapOption<Frame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    taken: AtomicU64,
    dropped: AtomicU64,
}

/// Counter snapshot for a [`FrameBridge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    pub taken: u64,
    /// Frames released without being taken (superseded or cleared)
    pub dropped: u64,
}

impl Default for FrameBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBridge {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: install `frame`, releasing any frame nobody took.
    ///
    /// Returns `true` when an unconsumed frame was superseded.
    pub fn publish(&self, frame: Frame) -> bool {
        let previous = self.slot.swap(Some(Arc::new(frame)));
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        match previous {
            Some(stale) => {
                drop(stale);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Consumer: take the pending frame, if one arrived since the last take.
    pub fn take(&self) -> Option<Frame> {
        let frame = self.slot.swap(None)?;
        match Arc::try_unwrap(frame) {
            Ok(frame) => {
                self.stats.taken.fetch_add(1, Ordering::Relaxed);
                Some(frame)
            }
            Err(_) => {
                warn!("frame slot was shared, dropping frame");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Release any pending frame.
    pub fn clear(&self) {
        if self.slot.swap(None).is_some() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            published: self.stats.published.load(Ordering::Relaxed),
            taken: self.stats.taken.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pool::BufferPool;
    use crate::capture::PixelFormat;

    fn frame(pool: &BufferPool, sequence: u64) -> Frame {
        let mut buf = pool.acquire(4);
        buf.vec_mut().extend_from_slice(&[0, 0, 0, 255]);
        Frame::packed(1, 1, PixelFormat::Rgba32, buf).with_sequence(sequence)
    }

    #[test]
    fn take_on_empty_bridge_returns_none() {
        let bridge = FrameBridge::new();
        assert!(bridge.take().is_none());
    }

    #[test]
    fn latest_publish_wins() {
        let pool = BufferPool::new(4);
        let bridge = FrameBridge::new();
        assert!(!bridge.publish(frame(&pool, 1)));
        assert!(bridge.publish(frame(&pool, 2)));
        assert!(bridge.publish(frame(&pool, 3)));

        let taken = bridge.take().expect("frame pending");
        assert_eq!(taken.sequence, 3);
        assert!(bridge.take().is_none(), "a frame must never be observed twice");
    }

    #[test]
    fn superseded_frames_are_released_immediately() {
        let pool = BufferPool::new(4);
        let bridge = FrameBridge::new();
        bridge.publish(frame(&pool, 1));
        bridge.publish(frame(&pool, 2));
        assert_eq!(pool.outstanding(), 1);

        drop(bridge.take());
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(
            bridge.stats(),
            BridgeStats {
                published: 2,
                taken: 1,
                dropped: 1
            }
        );
    }

    #[test]
    fn clear_releases_pending_frame() {
        let pool = BufferPool::new(2);
        let bridge = FrameBridge::new();
        bridge.publish(frame(&pool, 1));
        bridge.clear();
        assert_eq!(pool.outstanding(), 0);
        assert!(bridge.take().is_none());
    }

    #[test]
    fn concurrent_producer_and_consumer_preserve_order_and_hold_counts() {
        let pool = BufferPool::new(4);
        let bridge = Arc::new(FrameBridge::new());
        const FRAMES: u64 = 5_000;

        let producer = {
            let bridge = Arc::clone(&bridge);
            let pool = pool.clone();
            std::thread::spawn(move || {
                for seq in 1..=FRAMES {
                    bridge.publish(frame(&pool, seq));
                }
            })
        };

        let mut last = 0;
        let mut seen = 0;
        while last < FRAMES {
            if let Some(f) = bridge.take() {
                assert!(f.sequence > last, "frames must never be reordered");
                last = f.sequence;
                seen += 1;
            } else if producer.is_finished() && last < FRAMES {
                // the final frame is always left in the slot for us
                let f = bridge.take().expect("final frame must survive");
                assert_eq!(f.sequence, FRAMES);
                last = f.sequence;
                seen += 1;
            }
        }
        producer.join().unwrap();

        let stats = bridge.stats();
        assert_eq!(stats.published, FRAMES);
        assert_eq!(stats.taken, seen);
        assert_eq!(stats.taken + stats.dropped, FRAMES);
        assert_eq!(pool.outstanding(), 0);
    }
}

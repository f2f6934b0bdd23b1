//! Reusable frame buffers shared between the capture thread and whoever
//! currently holds a frame.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

struct PoolInner {
    free: ArrayQueue<Vec<u8>>,
    released: AtomicBool,
    outstanding: AtomicUsize,
    allocated: AtomicUsize,
}

impl PoolInner {
    fn drain(&self) {
        while self.free.pop().is_some() {}
    }
}

/// Small pool of byte buffers recycled across frames.
///
/// Buffers handed out by [`BufferPool::acquire`] find their way back when the
/// [`FrameBuffer`] holding them is dropped. After [`BufferPool::release`] the
/// pool stops recycling and returned buffers are freed instead.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(capacity.max(1)),
                released: AtomicBool::new(false),
                outstanding: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Hand out a zero-length buffer with at least `capacity` bytes reserved.
    ///
    /// Never blocks: when every pooled buffer is in flight a fresh one is
    /// allocated.
    pub fn acquire(&self, capacity: usize) -> FrameBuffer {
        let mut data = match self.inner.free.pop() {
            Some(buf) => buf,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };
        data.clear();
        data.reserve(capacity);

        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        FrameBuffer {
            data,
            home: Some(Arc::clone(&self.inner)),
        }
    }

    /// Number of buffers currently held outside the pool.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Total number of buffers this pool ever had to allocate.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Buffers sitting idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.free.len()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Free idle buffers and stop recycling. Idempotent.
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::Release);
        self.inner.drain();
    }
}

/// Byte storage for one frame plane.
///
/// Either borrowed from a [`BufferPool`] (returned on drop) or detached.
#[derive(Default)]
pub struct FrameBuffer {
    data: Vec<u8>,
    home: Option<Arc<PoolInner>>,
}

impl FrameBuffer {
    /// Buffer that is not tracked by any pool.
    pub fn detached(data: Vec<u8>) -> Self {
        Self { data, home: None }
    }

    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }

    /// Mutable access to the backing vector so producers can fill it in place.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl From<Vec<u8>> for FrameBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::detached(data)
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        let Some(home) = self.home.take() else {
            return;
        };
        home.outstanding.fetch_sub(1, Ordering::AcqRel);
        if home.released.load(Ordering::Acquire) {
            return;
        }
        // A full pool simply lets the buffer go.
        let _ = home.free.push(std::mem::take(&mut self.data));
        // release() may have drained between the check and the push
        if home.released.load(Ordering::Acquire) {
            home.drain();
        }
    }
}

//! Capture device/session state machine.
//!
//! `open` moves the source `Closed → Opening` on the caller's thread and hands
//! the slow part (enumeration, device open, session configuration) to a
//! dedicated capture thread, which then keeps publishing frames into the
//! [`FrameBridge`] until the session ends. Every open bumps a generation
//! counter; the capture thread and every callback it schedules carry that
//! generation as a token, and anything carrying a stale token is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, instrument, trace, warn};

use super::backend::{CaptureBackend, CaptureDevice, CaptureSession, PermissionGate};
use super::device::{DeviceEnumerator, Resolution};
use super::pool::BufferPool;
use crate::error::{PipelineError, Result};
use crate::pipeline::bridge::FrameBridge;

/// Capture device lifecycle as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Closed,
    Opening,
    Previewing,
    Closing,
}

/// Deferred notification.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Where open/error notifications run.
#[derive(Clone, Default)]
pub enum CallbackContext {
    /// Inline on whichever thread produces the notification: the capture
    /// thread for open results and disconnects, the caller of `open` for a
    /// denied permission.
    #[default]
    Inline,
    /// Queued in order for another thread (usually the UI loop) to run.
    Queue(flume::Sender<Callback>),
}

impl CallbackContext {
    /// Context backed by an unbounded queue; drain the receiver to run callbacks.
    pub fn queue() -> (Self, flume::Receiver<Callback>) {
        let (tx, rx) = flume::unbounded();
        (Self::Queue(tx), rx)
    }

    fn dispatch(&self, callback: Callback) {
        match self {
            Self::Inline => callback(),
            Self::Queue(tx) => {
                if tx.send(callback).is_err() {
                    debug!("callback queue closed, dropping notification");
                }
            }
        }
    }
}

/// Capture-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub sessions_opened: u64,
    pub frames_captured: u64,
    /// Frames replaced in the bridge before the renderer took them
    pub frames_superseded: u64,
}

#[derive(Default)]
struct Counters {
    sessions_opened: AtomicU64,
    frames_captured: AtomicU64,
    frames_superseded: AtomicU64,
}

struct Lifecycle {
    state: PipelineState,
    generation: u64,
    /// Thread running the most recent capture worker
    capture_thread: Option<ThreadId>,
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    /// Signalled whenever the state becomes `Closed`
    settled: Condvar,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> PipelineState {
        self.lifecycle.lock().state
    }

    fn is_current(&self, token: u64) -> bool {
        self.lifecycle.lock().generation == token
    }

    /// `Opening → Previewing`, only for the live session.
    fn advance(&self, token: u64) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.generation == token && lc.state == PipelineState::Opening {
            lc.state = PipelineState::Previewing;
            true
        } else {
            false
        }
    }

    /// The live session failed on its own: straight to `Closed`.
    fn fail(&self, token: u64) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.generation == token && lc.state != PipelineState::Closed {
            lc.state = PipelineState::Closed;
            self.settled.notify_all();
            true
        } else {
            false
        }
    }

    /// Finish a close that bumped the generation to `closing_generation`.
    fn settle_close(&self, closing_generation: u64) {
        let mut lc = self.lifecycle.lock();
        if lc.generation == closing_generation && lc.state == PipelineState::Closing {
            lc.state = PipelineState::Closed;
            self.settled.notify_all();
        }
    }

    /// Block until no close is in flight.
    fn wait_settled(&self) {
        let mut lc = self.lifecycle.lock();
        while lc.state == PipelineState::Closing {
            self.settled.wait(&mut lc);
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    thread: ThreadId,
}

/// Owns the capture device, its session and the buffer pool for one open.
///
/// Callbacks fire on the configured [`CallbackContext`]; `open` never blocks
/// on device I/O, `close` does.
pub struct FrameSource {
    backend: Arc<dyn CaptureBackend>,
    gate: Arc<dyn PermissionGate>,
    bridge: Arc<FrameBridge>,
    context: CallbackContext,
    buffer_count: usize,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl FrameSource {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        gate: Arc<dyn PermissionGate>,
        bridge: Arc<FrameBridge>,
    ) -> Self {
        Self {
            backend,
            gate,
            bridge,
            context: CallbackContext::default(),
            buffer_count: 4,
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle {
                    state: PipelineState::Closed,
                    generation: 0,
                    capture_thread: None,
                }),
                settled: Condvar::new(),
                counters: Counters::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn with_callback_context(mut self, context: CallbackContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count.max(1);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn bridge(&self) -> &Arc<FrameBridge> {
        &self.bridge
    }

    pub fn stats(&self) -> CaptureStats {
        let c = &self.shared.counters;
        CaptureStats {
            sessions_opened: c.sessions_opened.load(Ordering::Relaxed),
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            frames_superseded: c.frames_superseded.load(Ordering::Relaxed),
        }
    }

    /// Start acquiring a capture device producing frames close to `target`.
    ///
    /// Exactly one of `on_opened` / `on_error` eventually runs for the open
    /// itself; once previewing, `on_error` is kept for a later disconnect.
    /// Returns `Err(AlreadyOpen)` without invoking either callback when the
    /// source is not `Closed`.
    #[instrument(skip(self, on_opened, on_error))]
    pub fn open<O, E>(&self, target: Resolution, on_opened: O, on_error: E) -> Result<()>
    where
        O: FnOnce(Resolution) + Send + 'static,
        E: FnOnce(PipelineError) + Send + 'static,
    {
        self.reap_finished_worker();

        let mut slot = self.worker.lock();
        let token = {
            let mut lc = self.shared.lifecycle.lock();
            if lc.state != PipelineState::Closed {
                return Err(PipelineError::AlreadyOpen(lc.state));
            }
            if !self.gate.is_granted() {
                None
            } else {
                lc.generation += 1;
                lc.state = PipelineState::Opening;
                Some(lc.generation)
            }
        };

        let Some(token) = token else {
            drop(slot);
            warn!("camera permission not granted");
            self.context
                .dispatch(Box::new(move || on_error(PipelineError::PermissionDenied)));
            return Ok(());
        };

        info!(token, %target, backend = self.backend.name(), "opening frame source");
        let worker = CaptureWorker {
            token,
            target,
            shared: Arc::clone(&self.shared),
            backend: Arc::clone(&self.backend),
            bridge: Arc::clone(&self.bridge),
            context: self.context.clone(),
            buffer_count: self.buffer_count,
            on_opened: Some(Box::new(on_opened)),
            on_error: Some(Box::new(on_error)),
        };

        let spawned = thread::Builder::new()
            .name(format!("capture-{token}"))
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                let thread = handle.thread().id();
                *slot = Some(Worker { handle, thread });
                Ok(())
            }
            Err(e) => {
                error!("failed to spawn capture thread: {e}");
                self.shared.fail(token);
                Err(PipelineError::DeviceUnavailable(format!(
                    "failed to spawn capture thread: {e}"
                )))
            }
        }
    }

    /// Stop capture and release the session, the device and the buffer pool,
    /// in that order. A no-op when already closed.
    ///
    /// Returns once the source is `Closed`, also when another thread started
    /// the close. Called from the capture thread itself (inside a callback
    /// delivered on [`CallbackContext::Inline`]) it cannot wait for its own
    /// thread; teardown then completes as soon as the callback returns.
    pub fn close(&self) {
        let (closing, on_capture_thread) = {
            let mut lc = self.shared.lifecycle.lock();
            let on_capture_thread = lc.capture_thread == Some(thread::current().id());
            let closing = match lc.state {
                PipelineState::Opening | PipelineState::Previewing => {
                    info!(from = ?lc.state, "closing frame source");
                    lc.state = PipelineState::Closing;
                    lc.generation += 1;
                    Some(lc.generation)
                }
                PipelineState::Closing | PipelineState::Closed => None,
            };
            (closing, on_capture_thread)
        };

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread == thread::current().id() {
                debug!("close requested from the capture thread");
            } else {
                if worker.handle.join().is_err() {
                    error!("capture thread panicked");
                }
                if let Some(generation) = closing {
                    self.shared.settle_close(generation);
                }
            }
        }

        if on_capture_thread {
            debug!("teardown continues when the capture callback returns");
        } else {
            self.shared.wait_settled();
        }

        if closing.is_some() {
            self.bridge.clear();
            info!("frame source closed");
        }
    }

    /// Join a capture thread whose session already ended on its own.
    fn reap_finished_worker(&self) {
        let stale = {
            let mut slot = self.worker.lock();
            if self.shared.state() == PipelineState::Closed {
                slot.take()
            } else {
                None
            }
        };
        if let Some(worker) = stale {
            if worker.thread != thread::current().id() && worker.handle.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Device, session and pool for one open, released in reverse acquisition
/// order no matter how the capture thread exits.
struct ActiveCapture {
    session: Option<Box<dyn CaptureSession>>,
    device: Option<Box<dyn CaptureDevice>>,
    pool: BufferPool,
    repeating: bool,
}

impl ActiveCapture {
    fn new(pool: BufferPool) -> Self {
        Self {
            session: None,
            device: None,
            pool,
            repeating: false,
        }
    }

    /// Best effort: a failing step is logged and the remaining steps still run.
    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if self.repeating {
                if let Err(e) = session.stop_repeating() {
                    error!("failed to stop repeating request: {e}");
                }
                self.repeating = false;
            }
            if let Err(e) = session.close() {
                error!("failed to close capture session: {e}");
            }
        }
        if let Some(mut device) = self.device.take() {
            let id = device.id().to_string();
            if let Err(e) = device.close() {
                error!(device = %id, "failed to close capture device: {e}");
            } else {
                debug!(device = %id, "capture device closed");
            }
        }
        if !self.pool.is_released() {
            self.pool.release();
        }
    }
}

impl Drop for ActiveCapture {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Leaves the lifecycle settled when the capture thread exits, including by
/// panic.
struct ExitGuard {
    shared: Arc<Shared>,
    token: u64,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut lc = self.shared.lifecycle.lock();
        let live = lc.generation == self.token
            && matches!(lc.state, PipelineState::Opening | PipelineState::Previewing);
        let closed_under_us = lc.generation == self.token + 1 && lc.state == PipelineState::Closing;
        if live || closed_under_us {
            lc.state = PipelineState::Closed;
            self.shared.settled.notify_all();
        }
    }
}

struct CaptureWorker {
    token: u64,
    target: Resolution,
    shared: Arc<Shared>,
    backend: Arc<dyn CaptureBackend>,
    bridge: Arc<FrameBridge>,
    context: CallbackContext,
    buffer_count: usize,
    on_opened: Option<Box<dyn FnOnce(Resolution) + Send>>,
    on_error: Option<Box<dyn FnOnce(PipelineError) + Send>>,
}

impl CaptureWorker {
    fn run(mut self) {
        self.shared.lifecycle.lock().capture_thread = Some(thread::current().id());
        // Declared first so it drops last, after the capture is torn down.
        let _guard = ExitGuard {
            shared: Arc::clone(&self.shared),
            token: self.token,
        };
        let mut active = ActiveCapture::new(BufferPool::new(self.buffer_count));

        match self.establish(&mut active) {
            Ok(true) => self.stream(&mut active),
            Ok(false) => debug!(token = self.token, "open superseded by close"),
            Err(err) => {
                active.teardown();
                self.fail(err);
            }
        }
    }

    /// Enumerate, open, configure and start streaming. `Ok(false)` when a
    /// close overtook the open; whatever was acquired is released by the
    /// caller's teardown.
    fn establish(&mut self, active: &mut ActiveCapture) -> Result<bool> {
        let (descriptor, resolution) = DeviceEnumerator::new(&*self.backend).select(self.target)?;
        if !self.shared.is_current(self.token) {
            return Ok(false);
        }

        let device = active
            .device
            .insert(self.backend.open_device(&descriptor).map_err(device_failure)?);
        if !self.shared.is_current(self.token) {
            return Ok(false);
        }

        let session = active.session.insert(
            device
                .create_session(resolution, active.pool.clone())
                .map_err(session_failure)?,
        );
        session.start_repeating().map_err(session_failure)?;
        active.repeating = true;

        if !self.shared.advance(self.token) {
            return Ok(false);
        }

        self.shared
            .counters
            .sessions_opened
            .fetch_add(1, Ordering::Relaxed);
        info!(token = self.token, device = %descriptor.id, %resolution, "previewing");

        if let Some(on_opened) = self.on_opened.take() {
            self.deliver(move || on_opened(resolution));
        }
        Ok(true)
    }

    fn stream(&mut self, active: &mut ActiveCapture) {
        while self.shared.is_current(self.token) {
            let Some(session) = active.session.as_mut() else {
                return;
            };
            match session.next_frame() {
                Ok(Some(frame)) => {
                    let counters = &self.shared.counters;
                    counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                    trace!(sequence = frame.sequence, "frame captured");
                    if self.bridge.publish(frame) {
                        counters.frames_superseded.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    active.teardown();
                    self.fail(disconnect(err));
                    return;
                }
            }
        }
        debug!(token = self.token, "capture loop stopped");
    }

    fn fail(&mut self, err: PipelineError) {
        if !self.shared.fail(self.token) {
            debug!(token = self.token, "discarding error from stale session: {err}");
            return;
        }
        warn!(token = self.token, "frame source failed: {err}");
        if let Some(on_error) = self.on_error.take() {
            self.deliver(move || on_error(err));
        }
    }

    /// Dispatch `f`, dropping it if the session is stale by the time it runs.
    fn deliver(&self, f: impl FnOnce() + Send + 'static) {
        let shared = Arc::clone(&self.shared);
        let token = self.token;
        self.context.dispatch(Box::new(move || {
            if shared.is_current(token) {
                f();
            } else {
                debug!(token, "dropping stale callback");
            }
        }));
    }
}

fn device_failure(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::DeviceUnavailable(_) | PipelineError::PermissionDenied => err,
        other => PipelineError::DeviceUnavailable(other.to_string()),
    }
}

fn session_failure(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::SessionConfigurationFailed(_) => err,
        other => PipelineError::SessionConfigurationFailed(other.to_string()),
    }
}

fn disconnect(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::DeviceDisconnected(_) => err,
        other => PipelineError::DeviceDisconnected(other.to_string()),
    }
}

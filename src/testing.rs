//! Hardware-free stand-ins for the capture and render backends.
//!
//! Used by the unit and integration tests, and handy for exercising the
//! pipeline on machines with neither a camera nor a GPU.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::capture::backend::{CaptureBackend, CaptureDevice, CaptureSession};
use crate::capture::device::{CaptureEncoding, DeviceDescriptor, Resolution};
use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::pool::BufferPool;
use crate::display::backend::RenderBackend;
use crate::error::{PipelineError, Result};

/// Install a test-friendly subscriber once per process.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("edgeview=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Backend call, in the order the capture thread made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureCall {
    Enumerate,
    OpenDevice(String),
    CreateSession(Resolution),
    StartRepeating,
    StopRepeating,
    CloseSession,
    CloseDevice(String),
}

/// Shared log of [`CaptureCall`]s.
#[derive(Debug, Clone, Default)]
pub struct CallJournal(Arc<Mutex<Vec<CaptureCall>>>);

impl CallJournal {
    fn push(&self, call: CaptureCall) {
        self.0.lock().push(call);
    }

    pub fn calls(&self) -> Vec<CaptureCall> {
        self.0.lock().clone()
    }

    pub fn contains(&self, call: &CaptureCall) -> bool {
        self.0.lock().contains(call)
    }

    /// Calls made after the last `StopRepeating`, starting with it.
    pub fn teardown(&self) -> Vec<CaptureCall> {
        let calls = self.0.lock();
        match calls.iter().rposition(|c| *c == CaptureCall::StopRepeating) {
            Some(pos) => calls[pos..].to_vec(),
            None => Vec::new(),
        }
    }
}

/// Holds `open_device` until released.
pub struct OpenGate {
    release: flume::Sender<()>,
    entered: flume::Receiver<()>,
}

impl OpenGate {
    /// Wait until the capture thread is blocked inside `open_device`.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

/// Makes every live scripted session report a lost device.
#[derive(Debug, Clone, Default)]
pub struct DisconnectSwitch(Arc<AtomicBool>);

impl DisconnectSwitch {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct Gate {
    release: flume::Receiver<()>,
    entered: flume::Sender<()>,
}

/// Capture backend following a script instead of hardware.
///
/// Sessions emit solid RGB frames of the session size whose bytes all equal
/// the low byte of the sequence number.
pub struct ScriptedCaptureBackend {
    devices: Vec<DeviceDescriptor>,
    journal: CallJournal,
    open_failure: Option<PipelineError>,
    session_failure: Option<PipelineError>,
    start_failure: Option<PipelineError>,
    stop_failure: Option<PipelineError>,
    session_close_failure: Option<PipelineError>,
    gate: Option<Gate>,
    disconnect: DisconnectSwitch,
    frame_interval: Duration,
}

impl Default for ScriptedCaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCaptureBackend {
    /// One device advertising 640x480, 1280x720 and 1920x1080.
    pub fn new() -> Self {
        Self {
            devices: vec![DeviceDescriptor {
                id: "scripted:0".to_string(),
                name: "Scripted Camera".to_string(),
                encoding: CaptureEncoding::Rgb24,
                resolutions: vec![
                    Resolution::new(640, 480),
                    Resolution::new(1280, 720),
                    Resolution::new(1920, 1080),
                ],
            }],
            journal: CallJournal::default(),
            open_failure: None,
            session_failure: None,
            start_failure: None,
            stop_failure: None,
            session_close_failure: None,
            gate: None,
            disconnect: DisconnectSwitch::default(),
            frame_interval: Duration::from_millis(5),
        }
    }

    pub fn with_devices(mut self, devices: Vec<DeviceDescriptor>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_resolutions(mut self, resolutions: Vec<Resolution>) -> Self {
        for device in &mut self.devices {
            device.resolutions = resolutions.clone();
        }
        self
    }

    pub fn failing_open(mut self, err: PipelineError) -> Self {
        self.open_failure = Some(err);
        self
    }

    pub fn failing_session(mut self, err: PipelineError) -> Self {
        self.session_failure = Some(err);
        self
    }

    pub fn failing_start(mut self, err: PipelineError) -> Self {
        self.start_failure = Some(err);
        self
    }

    /// Make `stop_repeating` fail; the call is still journaled.
    pub fn failing_stop(mut self, err: PipelineError) -> Self {
        self.stop_failure = Some(err);
        self
    }

    /// Make closing the session fail; the call is still journaled.
    pub fn failing_session_close(mut self, err: PipelineError) -> Self {
        self.session_close_failure = Some(err);
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Block `open_device` until the returned gate is released (or dropped).
    pub fn gated(mut self) -> (Self, OpenGate) {
        let (release_tx, release_rx) = flume::unbounded();
        let (entered_tx, entered_rx) = flume::unbounded();
        self.gate = Some(Gate {
            release: release_rx,
            entered: entered_tx,
        });
        let gate = OpenGate {
            release: release_tx,
            entered: entered_rx,
        };
        (self, gate)
    }

    pub fn journal(&self) -> CallJournal {
        self.journal.clone()
    }

    pub fn disconnect_switch(&self) -> DisconnectSwitch {
        self.disconnect.clone()
    }
}

impl CaptureBackend for ScriptedCaptureBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        self.journal.push(CaptureCall::Enumerate);
        Ok(self.devices.clone())
    }

    fn open_device(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureDevice>> {
        if let Some(gate) = &self.gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        if let Some(err) = &self.open_failure {
            return Err(err.clone());
        }
        self.journal.push(CaptureCall::OpenDevice(device.id.clone()));
        Ok(Box::new(ScriptedDevice {
            id: device.id.clone(),
            journal: self.journal.clone(),
            session_failure: self.session_failure.clone(),
            start_failure: self.start_failure.clone(),
            stop_failure: self.stop_failure.clone(),
            session_close_failure: self.session_close_failure.clone(),
            disconnect: self.disconnect.clone(),
            frame_interval: self.frame_interval,
        }))
    }
}

struct ScriptedDevice {
    id: String,
    journal: CallJournal,
    session_failure: Option<PipelineError>,
    start_failure: Option<PipelineError>,
    stop_failure: Option<PipelineError>,
    session_close_failure: Option<PipelineError>,
    disconnect: DisconnectSwitch,
    frame_interval: Duration,
}

impl CaptureDevice for ScriptedDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_session(
        &mut self,
        resolution: Resolution,
        pool: BufferPool,
    ) -> Result<Box<dyn CaptureSession>> {
        if let Some(err) = &self.session_failure {
            return Err(err.clone());
        }
        self.journal.push(CaptureCall::CreateSession(resolution));
        Ok(Box::new(ScriptedSession {
            resolution,
            pool,
            journal: self.journal.clone(),
            start_failure: self.start_failure.clone(),
            stop_failure: self.stop_failure.clone(),
            close_failure: self.session_close_failure.clone(),
            disconnect: self.disconnect.clone(),
            frame_interval: self.frame_interval,
            repeating: false,
            sequence: 0,
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.journal.push(CaptureCall::CloseDevice(self.id.clone()));
        Ok(())
    }
}

struct ScriptedSession {
    resolution: Resolution,
    pool: BufferPool,
    journal: CallJournal,
    start_failure: Option<PipelineError>,
    stop_failure: Option<PipelineError>,
    close_failure: Option<PipelineError>,
    disconnect: DisconnectSwitch,
    frame_interval: Duration,
    repeating: bool,
    sequence: u64,
}

impl CaptureSession for ScriptedSession {
    fn start_repeating(&mut self) -> Result<()> {
        if let Some(err) = &self.start_failure {
            return Err(err.clone());
        }
        self.journal.push(CaptureCall::StartRepeating);
        self.repeating = true;
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<()> {
        self.journal.push(CaptureCall::StopRepeating);
        if let Some(err) = &self.stop_failure {
            return Err(err.clone());
        }
        self.repeating = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        thread::sleep(self.frame_interval);
        if self.disconnect.is_triggered() {
            return Err(PipelineError::DeviceDisconnected("scripted unplug".into()));
        }
        if !self.repeating {
            return Ok(None);
        }

        self.sequence += 1;
        let Resolution { width, height } = self.resolution;
        let len = width as usize * height as usize * 3;
        let mut buf = self.pool.acquire(len);
        buf.vec_mut().resize(len, self.sequence as u8);
        Ok(Some(
            Frame::packed(width, height, PixelFormat::Rgb24, buf).with_sequence(self.sequence),
        ))
    }

    fn close(&mut self) -> Result<()> {
        self.journal.push(CaptureCall::CloseSession);
        match &self.close_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// GPU call recorded by [`RecordingRenderBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCall {
    Compile { label: String },
    CreateTexture { id: u64, width: u32, height: u32 },
    DestroyTexture { id: u64 },
    Upload(Upload),
    Draw { program: String, texture: Option<u64> },
    ResizeSurface { width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub texture: u64,
    pub width: u32,
    pub height: u32,
    pub len: usize,
    pub first_pixel: [u8; 4],
}

/// Render backend that records calls instead of touching a GPU.
///
/// Programs are their labels, textures are sequential ids.
#[derive(Debug, Default)]
pub struct RecordingRenderBackend {
    calls: Vec<RenderCall>,
    failing: Vec<String>,
    live_textures: Vec<u64>,
    next_texture: u64,
}

impl RecordingRenderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make compiling the program labelled `label` fail.
    pub fn fail_compile(mut self, label: &str) -> Self {
        self.failing.push(label.to_string());
        self
    }

    pub fn calls(&self) -> &[RenderCall] {
        &self.calls
    }

    /// Program labels of every draw, in order.
    pub fn draws(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                RenderCall::Draw { program, .. } => Some(program.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                RenderCall::Upload(upload) => Some(upload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Textures created and not yet destroyed.
    pub fn live_textures(&self) -> &[u64] {
        &self.live_textures
    }
}

impl RenderBackend for RecordingRenderBackend {
    type Program = String;
    type Texture = u64;

    fn compile_program(&mut self, label: &str, _vertex: &str, _fragment: &str) -> Result<String> {
        self.calls.push(RenderCall::Compile {
            label: label.to_string(),
        });
        if self.failing.iter().any(|f| f == label) {
            return Err(PipelineError::ShaderCompile {
                label: label.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(label.to_string())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<u64> {
        self.next_texture += 1;
        let id = self.next_texture;
        self.live_textures.push(id);
        self.calls.push(RenderCall::CreateTexture { id, width, height });
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: u64) {
        self.live_textures.retain(|t| *t != texture);
        self.calls.push(RenderCall::DestroyTexture { id: texture });
    }

    fn upload_texture(&mut self, texture: &u64, width: u32, height: u32, rgba: &[u8]) -> Result<()> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(PipelineError::Gpu(format!(
                "upload of {} bytes into {width}x{height} texture",
                rgba.len()
            )));
        }
        let mut first_pixel = [0u8; 4];
        if let Some(px) = rgba.get(..4) {
            first_pixel.copy_from_slice(px);
        }
        self.calls.push(RenderCall::Upload(Upload {
            texture: *texture,
            width,
            height,
            len: rgba.len(),
            first_pixel,
        }));
        Ok(())
    }

    fn draw_quad(&mut self, program: &String, texture: Option<&u64>) -> Result<()> {
        self.calls.push(RenderCall::Draw {
            program: program.clone(),
            texture: texture.copied(),
        });
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        self.calls.push(RenderCall::ResizeSurface { width, height });
    }
}

//! Viewer window: winit event loop driving the presenter and the camera

use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use tracing::{debug, error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

use super::gpu::WgpuRenderer;
use super::presenter::TexturePresenter;
use super::programs::ModeSwitch;
use crate::capture::{
    Callback, CallbackContext, FrameSource, PermissionGate, PipelineState, SyntheticBackend,
    V4l2Backend,
};
use crate::pipeline::{FrameBridge, Luma, RenderStats, Transform};
use crate::{CaptureBackendKind, Config};

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Application handler for the winit event loop
pub struct ViewerApp {
    config: Config,
    source: FrameSource,
    callbacks: flume::Receiver<Callback>,
    switch: ModeSwitch,
    stats: Arc<RenderStats>,
    presenter: Option<TexturePresenter<WgpuRenderer>>,
    transform_enabled: bool,
    resume_camera: bool,
    last_report: Instant,
    last_frames: u64,
}

impl ViewerApp {
    /// `callbacks` must be the receiving end of the source's callback queue.
    pub fn new(config: Config, source: FrameSource, callbacks: flume::Receiver<Callback>) -> Self {
        Self {
            switch: ModeSwitch::new(config.display.mode),
            transform_enabled: config.pipeline.transform,
            config,
            source,
            callbacks,
            stats: Arc::new(RenderStats::new()),
            presenter: None,
            resume_camera: true,
            last_report: Instant::now(),
            last_frames: 0,
        }
    }

    fn create_presenter(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title("edgeview")
            .with_inner_size(LogicalSize::new(
                self.config.display.width,
                self.config.display.height,
            ));
        let window = Arc::new(event_loop.create_window(attrs)?);
        let size = window.inner_size();

        let renderer = WgpuRenderer::new(window, self.config.display.vsync)?;
        let mut presenter =
            TexturePresenter::new(renderer, Arc::clone(self.source.bridge()), self.switch.clone())
                .with_stats(Arc::clone(&self.stats));
        presenter.on_surface_created(size.width, size.height)?;
        self.presenter = Some(presenter);
        self.apply_transform();
        Ok(())
    }

    fn apply_transform(&mut self) {
        if let Some(presenter) = self.presenter.as_mut() {
            let transform = self
                .transform_enabled
                .then(|| Box::new(Luma) as Box<dyn Transform>);
            presenter.set_transform(transform);
        }
    }

    fn open_camera(&self) {
        let target = self.config.capture.target();
        let opened = self.source.open(
            target,
            |resolution| info!(%resolution, "camera opened"),
            |err| error!("camera error: {err}"),
        );
        if let Err(e) = opened {
            warn!("camera not opened: {e}");
        }
    }

    fn toggle_camera(&mut self) {
        match self.source.state() {
            PipelineState::Closed => self.open_camera(),
            PipelineState::Opening | PipelineState::Previewing => self.source.close(),
            PipelineState::Closing => debug!("camera is closing, ignoring toggle"),
        }
    }

    fn handle_key(&mut self, event: &KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        match &event.logical_key {
            Key::Named(NamedKey::Space) => {
                let mode = self.switch.toggle();
                info!(mode = mode.label(), "render mode switched");
            }
            Key::Character(c) if c.eq_ignore_ascii_case("t") => {
                self.transform_enabled = !self.transform_enabled;
                info!(enabled = self.transform_enabled, "transform toggled");
                self.apply_transform();
            }
            Key::Character(c) if c.eq_ignore_ascii_case("c") => self.toggle_camera(),
            _ => {}
        }
    }

    fn report_stats(&mut self) {
        if self.last_report.elapsed() < STATS_INTERVAL {
            return;
        }
        self.last_report = Instant::now();

        let snap = self.stats.snapshot();
        if snap.frames == self.last_frames {
            return;
        }
        self.last_frames = snap.frames;
        let capture = self.source.stats();
        info!(
            frames = snap.frames,
            fps = format!("{:.1}", snap.fps),
            avg_ms = format!("{:.2}", snap.average_processing().as_secs_f64() * 1000.0),
            captured = capture.frames_captured,
            superseded = capture.frames_superseded,
            "render stats"
        );
    }
}

impl ApplicationHandler for ViewerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.presenter.is_none() {
            if let Err(e) = self.create_presenter(event_loop) {
                error!("failed to initialise display: {e}");
                event_loop.exit();
                return;
            }
        }
        if self.resume_camera && self.source.state() == PipelineState::Closed {
            self.open_camera();
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        self.resume_camera = self.source.state() != PipelineState::Closed;
        info!(reopen = self.resume_camera, "suspended, releasing camera and surface");
        self.source.close();
        self.presenter = None;
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window close requested");
                self.source.close();
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(presenter) = self.presenter.as_mut() {
                    if let Err(e) = presenter.on_draw_requested() {
                        error!("Display error: {e}");
                    }
                }
            }
            WindowEvent::Resized(new_size) => {
                if let Some(presenter) = self.presenter.as_mut() {
                    presenter.on_surface_resized(new_size.width, new_size.height);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => self.handle_key(&event),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        for callback in self.callbacks.try_iter() {
            callback();
        }
        self.report_stats();
        if let Some(presenter) = &self.presenter {
            presenter.backend().window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.source.close();
    }
}

/// Build the frame source described by `config` and run the viewer until the
/// window closes.
pub fn run_viewer(config: Config) -> Result<()> {
    let bridge = Arc::new(FrameBridge::new());
    let (context, callbacks) = CallbackContext::queue();

    let source = match config.capture.backend {
        CaptureBackendKind::V4l2 => {
            let backend = V4l2Backend::new(config.capture.device.clone(), config.capture.buffer_count);
            let gate: Arc<dyn PermissionGate> = Arc::new(backend.permission_gate());
            FrameSource::new(Arc::new(backend), gate, bridge)
        }
        CaptureBackendKind::Synthetic => FrameSource::new(
            Arc::new(SyntheticBackend::new(config.capture.fps)),
            Arc::new(true),
            bridge,
        ),
    }
    .with_callback_context(context)
    .with_buffer_count(config.capture.buffer_count as usize);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ViewerApp::new(config, source, callbacks);
    event_loop.run_app(&mut app)?;
    Ok(())
}

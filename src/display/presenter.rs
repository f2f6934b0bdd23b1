//! Render-thread consumer: takes the latest frame, optionally transforms it,
//! keeps one texture sized to it and draws it with the active program.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::backend::RenderBackend;
use super::programs::{default_fragments, GpuProgramSet, ModeSwitch, RenderMode, VERTEX_SHADER};
use crate::error::{PipelineError, Result};
use crate::pipeline::bridge::FrameBridge;
use crate::pipeline::stats::RenderStats;
use crate::pipeline::transform::Transform;

/// Two texture recreations closer than this are reported as a resize storm.
const RESIZE_STORM_WINDOW: Duration = Duration::from_secs(1);

/// Pixel layout of the frame texture. Gray and RGB frames are expanded to
/// it on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8Srgb,
}

/// The texture frames are uploaded into.
#[derive(Debug)]
pub struct GpuTexture<T> {
    pub id: u64,
    pub handle: T,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// What a tick put on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A new frame was uploaded and drawn.
    Presented { width: u32, height: u32 },
    /// Nothing new; the previous texture was drawn again.
    Redrawn,
    /// No frame has arrived yet; the surface was cleared.
    Cleared,
}

/// Owns the GPU side of the pipeline. Only the surface lifecycle methods
/// touch GPU objects, and all of them must run on the render thread.
pub struct TexturePresenter<B: RenderBackend> {
    backend: B,
    bridge: Arc<FrameBridge>,
    switch: ModeSwitch,
    vertex: String,
    fragments: Vec<(RenderMode, String)>,
    programs: Option<GpuProgramSet<B::Program>>,
    texture: Option<GpuTexture<B::Texture>>,
    next_texture_id: u64,
    last_recreation: Option<Instant>,
    transform: Option<Box<dyn Transform>>,
    stats: Arc<RenderStats>,
}

impl<B: RenderBackend> TexturePresenter<B> {
    pub fn new(backend: B, bridge: Arc<FrameBridge>, switch: ModeSwitch) -> Self {
        Self {
            backend,
            bridge,
            switch,
            vertex: VERTEX_SHADER.to_string(),
            fragments: default_fragments(),
            programs: None,
            texture: None,
            next_texture_id: 1,
            last_recreation: None,
            transform: None,
            stats: Arc::new(RenderStats::new()),
        }
    }

    /// Replace the built-in shader sources used at the next surface creation.
    pub fn with_shaders(mut self, vertex: String, fragments: Vec<(RenderMode, String)>) -> Self {
        self.vertex = vertex;
        self.fragments = fragments;
        self
    }

    pub fn with_stats(mut self, stats: Arc<RenderStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Attach or detach the per-frame transform. Takes effect on the next tick.
    pub fn set_transform(&mut self, transform: Option<Box<dyn Transform>>) {
        self.transform = transform;
    }

    pub fn has_transform(&self) -> bool {
        self.transform.is_some()
    }

    pub fn mode_switch(&self) -> &ModeSwitch {
        &self.switch
    }

    pub fn stats(&self) -> &Arc<RenderStats> {
        &self.stats
    }

    pub fn programs(&self) -> Option<&GpuProgramSet<B::Program>> {
        self.programs.as_ref()
    }

    pub fn texture(&self) -> Option<&GpuTexture<B::Texture>> {
        self.texture.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Compile the programs for a fresh surface.
    ///
    /// Any texture from a previous surface is dropped and recreated on the
    /// next frame.
    #[instrument(skip(self))]
    pub fn on_surface_created(&mut self, width: u32, height: u32) -> Result<()> {
        self.backend.resize_surface(width, height);
        if let Some(old) = self.texture.take() {
            self.backend.destroy_texture(old.handle);
        }
        let programs = GpuProgramSet::compile(
            &mut self.backend,
            &self.vertex,
            &self.fragments,
            self.switch.clone(),
        )?;
        for mode in programs.failed_modes() {
            warn!(mode = mode.label(), "mode unavailable, rendering pass-through instead");
        }
        self.programs = Some(programs);
        info!(width, height, "surface created");
        Ok(())
    }

    pub fn on_surface_resized(&mut self, width: u32, height: u32) {
        debug!(width, height, "surface resized");
        self.backend.resize_surface(width, height);
    }

    /// Draw one frame if the surface is ready.
    pub fn on_draw_requested(&mut self) -> Result<Option<TickOutcome>> {
        if self.programs.is_none() {
            debug!("draw requested before surface creation");
            return Ok(None);
        }
        self.render_tick().map(Some)
    }

    /// One render pass: take the latest frame (if any), transform, upload,
    /// draw.
    pub fn render_tick(&mut self) -> Result<TickOutcome> {
        // Mode is fixed for the whole tick
        let mode = self.switch.get();
        if self.programs.is_none() {
            return Err(PipelineError::Gpu("surface not created".into()));
        }

        let Some(frame) = self.bridge.take() else {
            return self.redraw(mode);
        };

        let start = Instant::now();
        let frame = match self.transform.as_mut() {
            Some(transform) => match transform.transform(frame) {
                Ok(out) => out,
                Err(rejected) => {
                    warn!(sequence = rejected.frame.sequence, "transform failed: {}", rejected.error);
                    self.stats.record_transform_failure();
                    rejected.frame
                }
            },
            None => frame,
        };

        let (width, height) = (frame.width, frame.height);
        self.ensure_texture(width, height)?;

        let rgba = frame.to_rgba();
        let (Some(programs), Some(texture)) = (self.programs.as_ref(), self.texture.as_ref()) else {
            return Err(PipelineError::Gpu("texture unavailable".into()));
        };
        self.backend
            .upload_texture(&texture.handle, width, height, &rgba)?;
        self.backend
            .draw_quad(&programs.program(mode).handle, Some(&texture.handle))?;
        drop(rgba);
        drop(frame);

        let elapsed = start.elapsed();
        self.stats.record_frame(elapsed);
        metrics::histogram!("render_time_us").record(elapsed.as_micros() as f64);

        Ok(TickOutcome::Presented { width, height })
    }

    fn redraw(&mut self, mode: RenderMode) -> Result<TickOutcome> {
        let Some(programs) = self.programs.as_ref() else {
            return Err(PipelineError::Gpu("surface not created".into()));
        };
        let texture = self.texture.as_ref().map(|t| &t.handle);
        self.backend
            .draw_quad(&programs.program(mode).handle, texture)?;
        Ok(if texture.is_some() {
            TickOutcome::Redrawn
        } else {
            TickOutcome::Cleared
        })
    }

    /// Recreate the texture if the frame size changed.
    fn ensure_texture(&mut self, width: u32, height: u32) -> Result<()> {
        if let Some(tex) = &self.texture {
            if tex.width == width && tex.height == height {
                return Ok(());
            }
        }

        if let Some(old) = self.texture.take() {
            let now = Instant::now();
            if let Some(last) = self.last_recreation {
                if now.duration_since(last) < RESIZE_STORM_WINDOW {
                    warn!(
                        from_width = old.width,
                        from_height = old.height,
                        width,
                        height,
                        "texture resize storm"
                    );
                }
            }
            self.last_recreation = Some(now);
            self.stats.record_texture_recreation();
            self.backend.destroy_texture(old.handle);
        }

        let handle = self.backend.create_texture(width, height)?;
        let id = self.next_texture_id;
        self.next_texture_id += 1;
        debug!(id, width, height, "texture created");
        self.texture = Some(GpuTexture {
            id,
            handle,
            width,
            height,
            format: TextureFormat::Rgba8Srgb,
        });
        Ok(())
    }
}

//! Shader programs for the textured quad and the live mode switch.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::backend::RenderBackend;
use crate::error::{PipelineError, Result};

/// Shared vertex stage: passes position and texture coordinates through.
pub const VERTEX_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) tex_coord: vec2<f32>,
};

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) tex_coord: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = vec4<f32>(position, 1.0);
    out.tex_coord = tex_coord;
    return out;
}
"#;

pub const PASS_THROUGH_FRAGMENT: &str = r#"
@group(0) @binding(0) var frame_texture: texture_2d<f32>;
@group(0) @binding(1) var frame_sampler: sampler;

@fragment
fn fs_main(@location(0) tex_coord: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(frame_texture, frame_sampler, tex_coord);
}
"#;

pub const GRAYSCALE_FRAGMENT: &str = r#"
@group(0) @binding(0) var frame_texture: texture_2d<f32>;
@group(0) @binding(1) var frame_sampler: sampler;

@fragment
fn fs_main(@location(0) tex_coord: vec2<f32>) -> @location(0) vec4<f32> {
    let color = textureSample(frame_texture, frame_sampler, tex_coord);
    let luma = dot(color.rgb, vec3<f32>(0.299, 0.587, 0.114));
    return vec4<f32>(luma, luma, luma, color.a);
}
"#;

/// Built-in fragment stages, one per mode.
pub fn default_fragments() -> Vec<(RenderMode, String)> {
    vec![
        (RenderMode::PassThrough, PASS_THROUGH_FRAGMENT.to_string()),
        (RenderMode::Grayscale, GRAYSCALE_FRAGMENT.to_string()),
    ]
}

/// How the frame texture is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum RenderMode {
    #[default]
    PassThrough = 0,
    Grayscale = 1,
}

impl RenderMode {
    pub const ALL: [RenderMode; 2] = [RenderMode::PassThrough, RenderMode::Grayscale];

    pub fn label(self) -> &'static str {
        match self {
            RenderMode::PassThrough => "pass-through",
            RenderMode::Grayscale => "grayscale",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            RenderMode::PassThrough => RenderMode::Grayscale,
            RenderMode::Grayscale => RenderMode::PassThrough,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RenderMode::Grayscale,
            _ => RenderMode::PassThrough,
        }
    }
}

/// Cloneable handle to the active render mode.
///
/// Any thread may flip it; the render thread reads it once per tick.
#[derive(Debug, Clone, Default)]
pub struct ModeSwitch(Arc<AtomicU8>);

impl ModeSwitch {
    pub fn new(mode: RenderMode) -> Self {
        Self(Arc::new(AtomicU8::new(mode as u8)))
    }

    pub fn get(&self) -> RenderMode {
        RenderMode::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, mode: RenderMode) {
        self.0.store(mode as u8, Ordering::Release);
    }

    /// Flip to the other mode and return the new one.
    pub fn toggle(&self) -> RenderMode {
        let prev = self.0.fetch_xor(1, Ordering::AcqRel);
        RenderMode::from_u8(prev).toggled()
    }
}

/// A compiled program and the mode it implements.
#[derive(Debug)]
pub struct ShaderProgram<P> {
    pub mode: RenderMode,
    pub handle: P,
}

/// One program per [`RenderMode`], compiled together at surface creation.
pub struct GpuProgramSet<P> {
    pass_through: ShaderProgram<P>,
    others: Vec<ShaderProgram<P>>,
    switch: ModeSwitch,
    failed: Vec<RenderMode>,
}

impl<P> GpuProgramSet<P> {
    /// Compile every mode with the shared `vertex` stage.
    ///
    /// A mode whose fragment stage fails (or is missing) falls back to
    /// pass-through and is listed in [`failed_modes`](Self::failed_modes).
    /// Failing to build pass-through itself is fatal.
    pub fn compile<B>(
        backend: &mut B,
        vertex: &str,
        fragments: &[(RenderMode, String)],
        switch: ModeSwitch,
    ) -> Result<Self>
    where
        B: RenderBackend<Program = P>,
    {
        let mut build = |mode: RenderMode| match fragments.iter().find(|(m, _)| *m == mode) {
            Some((_, fragment)) => backend
                .compile_program(mode.label(), vertex, fragment)
                .map(|handle| ShaderProgram { mode, handle }),
            None => Err(PipelineError::ShaderCompile {
                label: mode.label().to_string(),
                message: "no fragment source".to_string(),
            }),
        };

        let pass_through = build(RenderMode::PassThrough)?;
        let mut others = Vec::new();
        let mut failed = Vec::new();
        for mode in RenderMode::ALL {
            if mode == RenderMode::PassThrough {
                continue;
            }
            match build(mode) {
                Ok(program) => others.push(program),
                Err(err) => {
                    warn!(mode = mode.label(), "falling back to pass-through: {err}");
                    failed.push(mode);
                }
            }
        }

        info!(failed = failed.len(), "shader programs compiled");
        Ok(Self {
            pass_through,
            others,
            switch,
            failed,
        })
    }

    pub fn switch(&self) -> &ModeSwitch {
        &self.switch
    }

    pub fn set_active_mode(&self, mode: RenderMode) {
        self.switch.set(mode);
    }

    pub fn active_mode(&self) -> RenderMode {
        self.switch.get()
    }

    /// Program used for `mode`, which is pass-through's if `mode` failed.
    pub fn program(&self, mode: RenderMode) -> &ShaderProgram<P> {
        self.others
            .iter()
            .find(|p| p.mode == mode)
            .unwrap_or(&self.pass_through)
    }

    pub fn active(&self) -> &ShaderProgram<P> {
        self.program(self.active_mode())
    }

    pub fn failed_modes(&self) -> &[RenderMode] {
        &self.failed
    }
}

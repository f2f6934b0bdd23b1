pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod testing;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameSource, PipelineState, PixelFormat, Resolution};
pub use display::{ModeSwitch, RenderMode, TexturePresenter};
pub use error::{PipelineError, Result};
pub use pipeline::{FrameBridge, RenderStats, Transform};

/// Prefix of the environment variables overriding [`Config`] fields.
pub const ENV_PREFIX: &str = "EDGEVIEW";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackendKind {
    #[default]
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackendKind,
    /// Device node to use; probed from `/dev/video*` when unset
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
}

impl CaptureConfig {
    pub fn target(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: CaptureBackendKind::V4l2,
            device: None,
            width: 1280,
            height: 720,
            fps: 30,
            buffer_count: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    /// Render mode at startup
    pub mode: RenderMode,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
            mode: RenderMode::PassThrough,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run the sample luma transform on every frame
    pub transform: bool,
}

impl Config {
    /// Defaults, then the TOML file at `path` (if given), then `EDGEVIEW_*`
    /// environment variables such as `EDGEVIEW_CAPTURE__WIDTH=640`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_720p() {
        let config = Config::default();
        assert_eq!(config.capture.target(), Resolution::new(1280, 720));
        assert_eq!(config.capture.buffer_count, 4);
        assert_eq!(config.display.mode, RenderMode::PassThrough);
        assert!(!config.pipeline.transform);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: Config = toml_like(
            r#"
            [capture]
            backend = "synthetic"
            width = 640
            "#,
        );
        assert_eq!(config.capture.backend, CaptureBackendKind::Synthetic);
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.capture.height, 720);
        assert_eq!(config.display, DisplayConfig::default());
    }

    fn toml_like(source: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }
}

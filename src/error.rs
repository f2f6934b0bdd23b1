use thiserror::Error;

use crate::capture::PipelineState;
use crate::pipeline::transform::TransformError;

/// Errors produced anywhere along the camera-to-GPU pipeline.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("camera permission not granted")]
    PermissionDenied,

    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),

    #[error("device has no usable output sizes: {0}")]
    ConfigurationError(String),

    #[error("capture session configuration failed: {0}")]
    SessionConfigurationFailed(String),

    #[error("capture device disconnected: {0}")]
    DeviceDisconnected(String),

    #[error("frame source is already {0:?}")]
    AlreadyOpen(PipelineState),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("shader compilation failed for {label}: {message}")]
    ShaderCompile { label: String, message: String },

    #[error("gpu error: {0}")]
    Gpu(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;

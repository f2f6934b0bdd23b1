pub mod backend;
pub mod gpu;
pub mod presenter;
pub mod programs;
pub mod window;

pub use backend::RenderBackend;
pub use gpu::WgpuRenderer;
pub use presenter::{GpuTexture, TexturePresenter, TextureFormat, TickOutcome};
pub use programs::{GpuProgramSet, ModeSwitch, RenderMode, ShaderProgram};
pub use window::{run_viewer, ViewerApp};

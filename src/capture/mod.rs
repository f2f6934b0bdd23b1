pub mod backend;
pub mod decoder;
pub mod device;
pub mod frame;
pub mod pool;
pub mod source;
pub mod synthetic;
pub mod v4l2;

pub use backend::{CaptureBackend, CaptureDevice, CaptureSession, PermissionGate};
pub use device::{choose_resolution, CaptureEncoding, DeviceDescriptor, DeviceEnumerator, Resolution};
pub use frame::{Frame, PixelFormat, Plane};
pub use pool::{BufferPool, FrameBuffer};
pub use source::{Callback, CallbackContext, CaptureStats, FrameSource, PipelineState};
pub use synthetic::SyntheticBackend;
pub use v4l2::V4l2Backend;

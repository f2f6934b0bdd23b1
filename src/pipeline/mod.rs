pub mod bridge;
pub mod stats;
pub mod transform;

pub use bridge::{BridgeStats, FrameBridge};
pub use stats::{RenderStats, StatsSnapshot};
pub use transform::{Luma, Rejected, Transform, TransformError, TransformResult};

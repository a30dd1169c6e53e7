//! Execution side of a worker: the device-bound context and the image processors it runs.

mod context;
mod matte;

pub use context::{EngineConfig, EngineError, ExecutionContext, ImageProcessor};
pub use matte::BorderMatte;
pub use rmbg_types::Device;

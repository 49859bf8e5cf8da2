//! Software driver for `chroma-render`.
//!
//! Everything lives on the CPU: images and buffers are byte arrays, command
//! streams are interpreted synchronously at submit, fences signal
//! immediately, and "shaders" are Rust closures registered with the
//! [`ShaderRegistry`] and compiled through [`SoftCompiler`]. A small scanline
//! rasterizer backs the draw path, so the full frame-graph pipeline
//! (barriers included) can be exercised end to end without a GPU.
//!
//! Typical setup:
//!
//! ```ignore
//! let registry = ShaderRegistry::new();
//! registry.register_compute("fill", reflection, Arc::new(|inv| { /* ... */ }));
//! let driver = SoftDriver::new(registry.clone());
//! let compiler = Arc::new(SoftCompiler::new(registry));
//! let fg = FrameGraph::new(driver, compiler, FrameGraphConfig::default())?;
//! ```

mod backend;
mod execute;
mod shaders;

pub use crate::backend::SoftDriver;
pub use crate::shaders::{
    ComputeFn, ComputeInvocation, FragmentFn, FragmentInput, ShaderRegistry, SoftCompiler,
    VertexFn, VertexInput, VertexOutput,
};

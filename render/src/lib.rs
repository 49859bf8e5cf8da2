//! Chroma render: a frame-graph scheduler for GPU work.
//!
//! Clients describe frames declaratively: resources are opaque generational
//! handles, and work is recorded as a graph of tasks (draws, dispatches,
//! copies, reads, uploads) into per-frame command buffers. The core resolves
//! dependencies, inserts the required barriers, layout transitions and queue
//! ownership transfers, batches submission, and manages the lifetime of every
//! GPU object, staging buffer and descriptor set it hands out.
//!
//! The crate talks to the GPU exclusively through the [`driver`] interfaces;
//! shader compilation is likewise external. See the `chroma-render-soft`
//! crate for a CPU reference driver used by the test suite.
//!
//! A frame, in five lines:
//!
//! ```ignore
//! let mut cmd = fg.begin(CommandBufferDesc::new().name("frame"), &[])?;
//! let t0 = cmd.task(DispatchCompute::new().pipeline(ppln).add_resources("0", &res).dispatch([2, 2]))?;
//! cmd.task(ReadImage::new().image(img, [0; 3], [16, 16]).depends_on(t0).callback(on_loaded))?;
//! fg.execute(cmd);
//! fg.wait_idle();
//! ```

pub mod autores;
pub mod buffer;
pub mod command;
pub mod debug;
pub mod driver;
pub mod error;
pub mod format;
pub mod graph;
pub mod handle;
pub mod image;
pub mod memory;
pub mod names;
pub mod pipeline;
pub mod resource;
pub mod sampler;
mod sched;
pub mod staging;
mod submit;
pub mod sync;
#[cfg(test)]
mod testutil;
mod util;

pub use self::autores::AutoResource;
pub use self::buffer::{BufferDesc, BufferUsage, BufferView};
pub use self::command::{
    BlitImage, BuildRayTracingGeometry, ClearBuffer, ClearImage, CommandBuffer,
    CommandBufferDesc, CopyBuffer, CopyImage, CustomDraw, CustomDrawContext, DebugFlags,
    DispatchCompute, DrawIndexed, DrawMeshes, DrawVertices, Group, LogicalPassId, PresentImage,
    ReadBuffer, ReadImage, RenderPassDesc, RenderTarget, SubmitRenderPass, TaskId, TraceRays,
    UpdateBuffer, UpdateImage,
};
pub use self::debug::ShaderDebugCallback;
pub use self::driver::{
    AttachmentLoadOp, AttachmentStoreOp, ClearValue, Driver, FeatureFlags, ShaderCompiler,
    ShaderSource, SwapchainDesc,
};
pub use self::error::{Error, Result};
pub use self::graph::{FrameGraph, FrameGraphConfig};
pub use self::handle::{
    BufferId, CPipelineId, GPipelineId, ImageId, MPipelineId, RawId, RenderPassId, ResourceKind,
    RtPipelineId, SamplerId, SwapchainId,
};
pub use self::image::{
    Dimensions, ImageDesc, ImageLayer, ImageSubresourceLayers, ImageSubresourceRange, ImageUsage,
    ImageView, MipmapLevel, MultiSamples,
};
pub use self::format::Format;
pub use self::names::{DescriptorSetId, PushConstantId, RenderTargetId, UniformId, VertexId};
pub use self::pipeline::resources::PipelineResources;
pub use self::pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, MeshPipelineDesc, PrimitiveTopology,
    RayTracingPipelineDesc, ScissorRect, ShaderStage, Viewport,
};
pub use self::sampler::SamplerDesc;
pub use self::staging::{ReadbackStatus, StagingConfig};
pub use self::submit::{BatchToken, FrameStats};
pub use self::sync::QueueKind;
pub use self::util::content_hash;

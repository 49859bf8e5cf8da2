//! The driver abstraction consumed by the frame graph.
//!
//! The [`Driver`] trait is the only way the core touches the GPU: it creates
//! and destroys device objects, records linear command streams and submits
//! batches. Objects cross the boundary as opaque 64-bit ids minted by the
//! driver; the core never looks inside them. The model is Vulkan-like:
//! explicit layouts, explicit barriers, typed descriptor sets, binary
//! semaphores and fences.
//!
//! The [`ShaderCompiler`] trait is the second external collaborator: it turns
//! shader sources into bytecode plus a reflection record. Bytecode is opaque
//! to the core and is handed back to the driver verbatim at pipeline creation.

use crate::buffer::BufferDesc;
use crate::error::Result;
use crate::format::Format;
use crate::image::{ImageDesc, ImageSubresourceLayers, ImageSubresourceRange};
use crate::memory::{MemoryBlock, MemoryType};
use crate::pipeline::{
    ColorBlendState, DepthStencilState, DescriptorType, InputAssemblyState, PushConstantRange,
    RasterizationState, ShaderStage, ShaderStageFlags, VertexInputState,
};
use crate::sampler::SamplerDesc;
use crate::sync::{AccessFlags, ImageLayout, MemoryBarrier, QueueKind, StageFlags};
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

macro_rules! device_ids {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Copy, Clone, Eq, PartialEq, Hash)]
            pub struct $name(pub u64);

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        )*
    };
}

device_ids! {
    DeviceImage,
    DeviceBuffer,
    DeviceSampler,
    DevicePipeline,
    DeviceRenderPass,
    DeviceFramebuffer,
    DeviceDescriptorSetLayout,
    DeviceDescriptorPool,
    DeviceDescriptorSet,
    DeviceSemaphore,
    DeviceFence,
    /// One device heap; sub-allocated by the core's allocators.
    DeviceMemory,
    DeviceSwapchain,
    DeviceCommandList,
}

bitflags! {
    /// Optional device features the core can take advantage of.
    #[derive(Default)]
    pub struct FeatureFlags: u32 {
        const MESH_SHADER = 1 << 0;
        const RAY_TRACING = 1 << 1;
        const SHADER_DEBUG_TRACE = 1 << 2;
        const ASYNC_COMPUTE = 1 << 3;
        const TRANSFER_QUEUE = 1 << 4;
    }
}

/// Static device capabilities reported once at startup.
#[derive(Clone, Debug, Default)]
pub struct DriverCaps {
    pub features: FeatureFlags,
    /// Required alignment for staging copies.
    pub staging_alignment: u64,
    /// Preferred device heap size for the slab allocator.
    pub heap_size: u64,
}

/// How the memory of a new resource is provided.
#[derive(Copy, Clone, Debug)]
pub enum MemoryBind {
    /// The driver allocates dedicated memory of this type.
    Dedicated(MemoryType),
    /// The resource is placed into a sub-allocated block.
    SubAllocated(MemoryBlock),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    ColorU([u32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AttachmentLoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AttachmentStoreOp {
    Store,
    DontCare,
}

/// One attachment of a driver render pass, with the layouts the pass
/// transitions through. Hoisted first-use barriers become `initial_layout`;
/// deferred after-last-use transitions become `final_layout`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AttachmentDesc {
    pub format: Format,
    pub samples: u32,
    pub load_op: AttachmentLoadOp,
    pub store_op: AttachmentStoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

/// Render-pass description; doubles as the pipeline compatibility key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct RenderPassDesc {
    pub color_attachments: Vec<AttachmentDesc>,
    pub depth_attachment: Option<AttachmentDesc>,
}

/// Layout description handed to the driver when interning descriptor-set
/// layouts.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct LayoutBindingDesc {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: ShaderStageFlags,
}

/// One descriptor written into a set, with device-level object ids.
#[derive(Clone, Debug)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_index: u32,
    pub value: DescriptorValue,
}

#[derive(Clone, Debug)]
pub enum DescriptorValue {
    Sampler(DeviceSampler),
    SampledImage {
        image: DeviceImage,
        layout: ImageLayout,
    },
    CombinedImageSampler {
        image: DeviceImage,
        layout: ImageLayout,
        sampler: DeviceSampler,
    },
    StorageImage {
        image: DeviceImage,
    },
    UniformBuffer {
        buffer: DeviceBuffer,
        offset: u64,
        size: u64,
    },
    StorageBuffer {
        buffer: DeviceBuffer,
        offset: u64,
        size: u64,
    },
    UniformTexelBuffer {
        buffer: DeviceBuffer,
        format: Format,
    },
    StorageTexelBuffer {
        buffer: DeviceBuffer,
        format: Format,
    },
}

/// Pipeline layout at the driver boundary.
#[derive(Clone, Debug, Default)]
pub struct DevicePipelineLayout {
    pub set_layouts: Vec<DeviceDescriptorSetLayout>,
    pub push_constants: Vec<PushConstantRange>,
}

/// One compiled shader stage handed to pipeline creation.
#[derive(Clone)]
pub struct StageBytecode {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub bytecode: Arc<[u8]>,
}

impl fmt::Debug for StageBytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageBytecode")
            .field("stage", &self.stage)
            .field("entry_point", &self.entry_point)
            .field("bytecode_len", &self.bytecode.len())
            .finish()
    }
}

/// Everything the driver needs to build a graphics (or mesh) pipeline.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineCreateInfo<'a> {
    pub stages: &'a [StageBytecode],
    pub layout: &'a DevicePipelineLayout,
    pub render_pass: DeviceRenderPass,
    pub vertex_input: &'a VertexInputState,
    pub input_assembly: InputAssemblyState,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub color_blend: &'a ColorBlendState,
}

#[derive(Clone, Debug)]
pub struct ComputePipelineCreateInfo<'a> {
    pub stage: &'a StageBytecode,
    pub layout: &'a DevicePipelineLayout,
}

#[derive(Clone, Debug)]
pub struct RayTracingPipelineCreateInfo<'a> {
    pub stages: &'a [StageBytecode],
    pub layout: &'a DevicePipelineLayout,
    pub max_recursion_depth: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
    RayTracing,
}

// ---------------------------------------------------------------------------
// Command stream

#[derive(Copy, Clone, Debug, Default)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ImageCopy {
    pub src_subresource: ImageSubresourceLayers,
    pub src_offset: [i32; 3],
    pub dst_subresource: ImageSubresourceLayers,
    pub dst_offset: [i32; 3],
    pub extent: [u32; 3],
}

#[derive(Copy, Clone, Debug, Default)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    /// Texels per row in the buffer; 0 means tightly packed.
    pub buffer_row_length: u32,
    pub subresource: ImageSubresourceLayers,
    pub image_offset: [i32; 3],
    pub extent: [u32; 3],
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ImageBlit {
    pub src_subresource: ImageSubresourceLayers,
    pub src_bounds: [[i32; 3]; 2],
    pub dst_subresource: ImageSubresourceLayers,
    pub dst_bounds: [[i32; 3]; 2],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlitFilter {
    Nearest,
    Linear,
}

/// Barrier at the driver boundary (device ids, not core handles).
#[derive(Clone, Debug, Default)]
pub struct CmdPipelineBarrier {
    pub src_stage_mask: StageFlags,
    pub dst_stage_mask: StageFlags,
    pub memory: Vec<MemoryBarrier>,
    pub buffers: Vec<CmdBufferBarrier>,
    pub images: Vec<CmdImageBarrier>,
}

#[derive(Copy, Clone, Debug)]
pub struct CmdBufferBarrier {
    pub buffer: DeviceBuffer,
    pub src_access_mask: AccessFlags,
    pub dst_access_mask: AccessFlags,
    pub src_queue: QueueKind,
    pub dst_queue: QueueKind,
    pub offset: u64,
    pub size: u64,
}

#[derive(Copy, Clone, Debug)]
pub struct CmdImageBarrier {
    pub image: DeviceImage,
    pub src_access_mask: AccessFlags,
    pub dst_access_mask: AccessFlags,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_queue: QueueKind,
    pub dst_queue: QueueKind,
    pub range: ImageSubresourceRange,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct CmdViewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct CmdScissor {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// One operation of the linear command stream produced by the task
/// processor. The driver records these into its native command list format.
#[derive(Clone, Debug)]
pub enum DriverCmd {
    Barrier(CmdPipelineBarrier),
    BeginDebugGroup(String),
    EndDebugGroup,
    BeginRenderPass {
        render_pass: DeviceRenderPass,
        framebuffer: DeviceFramebuffer,
        render_area: CmdScissor,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: PipelineBindPoint,
        pipeline: DevicePipeline,
    },
    BindDescriptorSets {
        bind_point: PipelineBindPoint,
        first_set: u32,
        sets: Vec<DeviceDescriptorSet>,
    },
    PushConstants {
        stages: ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    SetViewports(Vec<CmdViewport>),
    SetScissors(Vec<CmdScissor>),
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(DeviceBuffer, u64)>,
    },
    BindIndexBuffer {
        buffer: DeviceBuffer,
        offset: u64,
        sixteen_bit: bool,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawMeshTasks {
        group_count: [u32; 3],
    },
    Dispatch {
        group_count: [u32; 3],
    },
    TraceRays {
        extent: [u32; 3],
    },
    CopyBuffer {
        src: DeviceBuffer,
        dst: DeviceBuffer,
        regions: Vec<BufferCopy>,
    },
    CopyImage {
        src: DeviceImage,
        src_layout: ImageLayout,
        dst: DeviceImage,
        dst_layout: ImageLayout,
        regions: Vec<ImageCopy>,
    },
    CopyBufferToImage {
        src: DeviceBuffer,
        dst: DeviceImage,
        dst_layout: ImageLayout,
        regions: Vec<BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: DeviceImage,
        src_layout: ImageLayout,
        dst: DeviceBuffer,
        regions: Vec<BufferImageCopy>,
    },
    BlitImage {
        src: DeviceImage,
        src_layout: ImageLayout,
        dst: DeviceImage,
        dst_layout: ImageLayout,
        filter: BlitFilter,
        regions: Vec<ImageBlit>,
    },
    ClearColorImage {
        image: DeviceImage,
        layout: ImageLayout,
        value: ClearValue,
        ranges: Vec<ImageSubresourceRange>,
    },
    ClearDepthStencilImage {
        image: DeviceImage,
        layout: ImageLayout,
        depth: f32,
        stencil: u32,
        ranges: Vec<ImageSubresourceRange>,
    },
    FillBuffer {
        buffer: DeviceBuffer,
        offset: u64,
        size: u64,
        value: u32,
    },
    UpdateBuffer {
        buffer: DeviceBuffer,
        offset: u64,
        data: Vec<u8>,
    },
    BuildAccelerationStructure {
        scratch: DeviceBuffer,
    },
}

/// One batch handed to [`Driver::submit`].
#[derive(Clone, Debug, Default)]
pub struct SubmitInfo {
    pub wait_semaphores: Vec<(DeviceSemaphore, StageFlags)>,
    pub command_lists: Vec<DeviceCommandList>,
    pub signal_semaphores: Vec<DeviceSemaphore>,
    pub fence: Option<DeviceFence>,
}

/// Swapchain creation descriptor.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub image_count: u32,
}

// ---------------------------------------------------------------------------

/// The GPU driver. All methods are internally synchronized; the core may
/// call them from any thread.
pub trait Driver: Send + Sync {
    fn caps(&self) -> DriverCaps;

    // Memory
    fn allocate_heap(&self, size: u64, memory_type: MemoryType) -> Result<DeviceMemory>;
    fn free_heap(&self, heap: DeviceMemory);

    // Resources
    fn create_image(
        &self,
        desc: &ImageDesc,
        memory: &MemoryBind,
        debug_name: Option<&str>,
    ) -> Result<DeviceImage>;
    fn destroy_image(&self, image: DeviceImage);

    fn create_buffer(
        &self,
        desc: &BufferDesc,
        memory: &MemoryBind,
        debug_name: Option<&str>,
    ) -> Result<DeviceBuffer>;
    fn destroy_buffer(&self, buffer: DeviceBuffer);

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<DeviceSampler>;
    fn destroy_sampler(&self, sampler: DeviceSampler);

    /// Host write into a host-visible buffer. Valid only for buffers created
    /// with `MemoryType::HostUpload`.
    fn write_buffer(&self, buffer: DeviceBuffer, offset: u64, data: &[u8]) -> Result<()>;
    /// Host read from a host-visible buffer. Valid only after the fence of
    /// the writing submission signaled.
    fn read_buffer(&self, buffer: DeviceBuffer, offset: u64, out: &mut [u8]) -> Result<()>;

    // Pipelines and layouts
    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBindingDesc],
    ) -> Result<DeviceDescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: DeviceDescriptorSetLayout);

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<DeviceRenderPass>;
    fn destroy_render_pass(&self, render_pass: DeviceRenderPass);

    fn create_framebuffer(
        &self,
        render_pass: DeviceRenderPass,
        attachments: &[DeviceImage],
        width: u32,
        height: u32,
    ) -> Result<DeviceFramebuffer>;
    fn destroy_framebuffer(&self, framebuffer: DeviceFramebuffer);

    fn create_graphics_pipeline(
        &self,
        info: &GraphicsPipelineCreateInfo<'_>,
    ) -> Result<DevicePipeline>;
    fn create_compute_pipeline(
        &self,
        info: &ComputePipelineCreateInfo<'_>,
    ) -> Result<DevicePipeline>;
    /// Optional; drivers without `FeatureFlags::RAY_TRACING` keep the
    /// default.
    fn create_ray_tracing_pipeline(
        &self,
        _info: &RayTracingPipelineCreateInfo<'_>,
    ) -> Result<DevicePipeline> {
        Err(crate::error::Error::ValidationFailed(
            "ray tracing is not supported by this driver".to_owned(),
        ))
    }
    fn destroy_pipeline(&self, pipeline: DevicePipeline);

    // Descriptors
    fn create_descriptor_pool(&self, max_sets: u32) -> Result<DeviceDescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: DeviceDescriptorPool);
    /// Frees every set allocated from the pool at once; there is no per-set
    /// free path.
    fn reset_descriptor_pool(&self, pool: DeviceDescriptorPool) -> Result<()>;
    fn allocate_descriptor_set(
        &self,
        pool: DeviceDescriptorPool,
        layout: DeviceDescriptorSetLayout,
    ) -> Result<DeviceDescriptorSet>;
    fn update_descriptor_set(
        &self,
        set: DeviceDescriptorSet,
        writes: &[DescriptorWrite],
    ) -> Result<()>;

    // Synchronization
    fn create_semaphore(&self) -> Result<DeviceSemaphore>;
    fn destroy_semaphore(&self, semaphore: DeviceSemaphore);
    fn create_fence(&self) -> Result<DeviceFence>;
    fn destroy_fence(&self, fence: DeviceFence);
    /// Non-blocking fence query.
    fn fence_signaled(&self, fence: DeviceFence) -> Result<bool>;
    /// Blocks until all fences signal or the timeout elapses. Returns `false`
    /// on timeout; `Err(DeviceLost)` if the device died.
    fn wait_fences(&self, fences: &[DeviceFence], timeout_ns: u64) -> Result<bool>;

    // Command streams
    fn record(&self, queue: QueueKind, cmds: &[DriverCmd]) -> Result<DeviceCommandList>;
    fn destroy_command_list(&self, list: DeviceCommandList);
    fn submit(&self, queue: QueueKind, submit: SubmitInfo) -> Result<()>;

    // Swapchain
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
    ) -> Result<(DeviceSwapchain, Vec<DeviceImage>)>;
    fn destroy_swapchain(&self, swapchain: DeviceSwapchain);
    /// Acquires the next image, signaling `semaphore` when it is ready.
    fn acquire_image(&self, swapchain: DeviceSwapchain, semaphore: DeviceSemaphore)
        -> Result<u32>;
    fn present(
        &self,
        queue: QueueKind,
        swapchain: DeviceSwapchain,
        image_index: u32,
        wait: DeviceSemaphore,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Shader compiler

#[derive(Clone, Debug)]
pub enum ShaderSource {
    /// Source text in whatever language the external compiler accepts.
    Text(String),
    /// Pre-compiled bytecode with a reflection record supplied alongside.
    Bytecode(Vec<u8>),
}

/// Where a debug-trace storage buffer must be bound when shader debugging is
/// enabled for an instrumented shader.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DebugTraceBinding {
    pub set: u32,
    pub binding: u32,
}

/// Output of the external shader compiler.
#[derive(Clone)]
pub struct CompiledShader {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub bytecode: Arc<[u8]>,
    pub reflection: crate::pipeline::ShaderReflection,
    /// Stable across recompilations of identical source + features.
    pub fingerprint: u64,
    /// Present only for instrumented compilations.
    pub debug_trace_binding: Option<DebugTraceBinding>,
}

impl fmt::Debug for CompiledShader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledShader")
            .field("stage", &self.stage)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// The external shader compiler.
pub trait ShaderCompiler: Send + Sync {
    fn compile(
        &self,
        source: &ShaderSource,
        stage: ShaderStage,
        entry_point: &str,
        features: FeatureFlags,
    ) -> Result<CompiledShader>;
}

//! Command buffers: per-frame task recording.
//!
//! A command buffer is a single-producer recorder returned by
//! [`FrameGraph::begin`]. Each `task` call validates its handles, appends a
//! node to the buffer's arena and returns a stable [`TaskId`] for
//! `depends_on` edges. Nothing touches the GPU during recording; `execute`
//! hands the finished graph to the task processor.
//!
//! Handle failures inside task payloads are deliberately resilient: they log
//! a validation warning and neuter the task instead of failing the frame, so
//! a stale id cannot take down an otherwise correct graph. Structural misuse
//! (no pipeline, uninitialized bindings, unknown set or push-constant names)
//! is a hard [`Error::ValidationFailed`].
//!
//! [`FrameGraph::begin`]: crate::graph::FrameGraph::begin
//! [`Error::ValidationFailed`]: crate::error::Error::ValidationFailed

use crate::driver::{
    AttachmentLoadOp, AttachmentStoreOp, BlitFilter, BufferCopy, ClearValue, DriverCmd, ImageBlit,
    ImageCopy,
};
use crate::error::{Error, Result};
use crate::handle::{
    BufferId, CPipelineId, GPipelineId, ImageId, MPipelineId, RawId, RtPipelineId, SwapchainId,
};
use crate::image::{ImageSubresourceLayers, ImageSubresourceRange};
use crate::names::{DescriptorSetId, PushConstantId, RenderTargetId};
use crate::pipeline::resources::PipelineResources;
use crate::pipeline::{ScissorRect, Viewport};
use crate::resource::ResourceManager;
use crate::staging::{BufferReadCallback, ImageReadCallback};
use crate::submit::BatchToken;
use crate::sync::{AccessFlags, ImageLayout, QueueKind, StageFlags};
use bitflags::bitflags;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Per-command-buffer debug options.
    #[derive(Default)]
    pub struct DebugFlags: u32 {
        /// Dump the task graph and inserted barriers after scheduling.
        const DUMP_GRAPH = 1 << 0;
        /// Annotate the emitted command stream with event markers.
        const MARKERS = 1 << 1;
        /// Allow shader debug tracing on tasks that request it.
        const SHADER_TRACE = 1 << 2;
    }
}

/// Descriptor passed to [`FrameGraph::begin`].
///
/// [`FrameGraph::begin`]: crate::graph::FrameGraph::begin
#[derive(Clone, Debug, Default)]
pub struct CommandBufferDesc {
    pub name: Option<String>,
    pub queue: QueueKind,
    pub debug: DebugFlags,
}

impl CommandBufferDesc {
    pub fn new() -> CommandBufferDesc {
        Default::default()
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    pub fn debug(mut self, debug: DebugFlags) -> Self {
        self.debug = debug;
        self
    }
}

/// Stable id of a recorded task within its command buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u32);

/// Id of a logical render pass opened with `create_render_pass`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LogicalPassId(pub(crate) u32);

/// One declared access of a task, as consumed by the barrier solver.
#[derive(Clone, Debug)]
pub struct ResourceAccess {
    pub resource: RawId,
    pub access: AccessFlags,
    pub stage: StageFlags,
    pub layout: Option<ImageLayout>,
    pub range: Option<ImageSubresourceRange>,
}

/// Push-constant bytes resolved against the pipeline's reflected range.
#[derive(Clone, Debug)]
pub struct PushConstantData {
    pub id: PushConstantId,
    pub stages: crate::pipeline::ShaderStageFlags,
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Bound descriptor tables of one dispatch/draw, by set index.
pub(crate) type BoundSets = SmallVec<[(u32, PipelineResources); 2]>;

pub(crate) struct DrawVerticesCall {
    pub pipeline: RawId,
    pub sets: BoundSets,
    pub push_constants: Vec<PushConstantData>,
    pub vertex_buffers: SmallVec<[(RawId, u64); 2]>,
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
    pub scissor: Option<ScissorRect>,
}

pub(crate) struct DrawIndexedCall {
    pub pipeline: RawId,
    pub sets: BoundSets,
    pub push_constants: Vec<PushConstantData>,
    pub vertex_buffers: SmallVec<[(RawId, u64); 2]>,
    pub index_buffer: (RawId, u64, bool),
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
    pub scissor: Option<ScissorRect>,
}

pub(crate) struct DrawMeshesCall {
    pub pipeline: RawId,
    pub sets: BoundSets,
    pub push_constants: Vec<PushConstantData>,
    pub group_count: [u32; 3],
    pub scissor: Option<ScissorRect>,
}

/// Context handed to [`CustomDraw`] callbacks at emission time.
pub struct CustomDrawContext<'a> {
    pub(crate) ops: &'a mut Vec<DriverCmd>,
    pub(crate) resolve_pipeline:
        &'a dyn Fn(RawId) -> Result<crate::driver::DevicePipeline>,
}

impl<'a> CustomDrawContext<'a> {
    /// Binds a graphics pipeline compatible with the surrounding pass.
    pub fn bind_pipeline(&mut self, pipeline: GPipelineId) -> Result<()> {
        let device = (self.resolve_pipeline)(pipeline.raw())?;
        self.ops.push(DriverCmd::BindPipeline {
            bind_point: crate::driver::PipelineBindPoint::Graphics,
            pipeline: device,
        });
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.ops.push(DriverCmd::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }
}

pub(crate) type CustomDrawCallback =
    Box<dyn FnOnce(&mut CustomDrawContext<'_>) -> Result<()> + Send + 'static>;

pub(crate) enum DrawCall {
    Vertices(DrawVerticesCall),
    Indexed(DrawIndexedCall),
    Meshes(DrawMeshesCall),
    Custom {
        callback: CustomDrawCallback,
        accesses: Vec<ResourceAccess>,
    },
}

/// One color or depth target of a logical render pass.
#[derive(Clone, Debug)]
pub struct RenderTarget {
    pub id: RenderTargetId,
    pub image: ImageId,
    pub load: AttachmentLoadOp,
    pub clear: Option<ClearValue>,
    pub store: AttachmentStoreOp,
}

/// Client-side description of one logical render pass.
#[derive(Clone, Debug, Default)]
pub struct RenderPassDesc {
    pub area: (u32, u32),
    pub color: Vec<RenderTarget>,
    pub depth: Option<RenderTarget>,
    pub viewports: Vec<Viewport>,
    pub scissors: Vec<ScissorRect>,
}

impl RenderPassDesc {
    pub fn new(area: (u32, u32)) -> RenderPassDesc {
        RenderPassDesc {
            area,
            ..Default::default()
        }
    }

    /// Adds a color target cleared to `clear` and stored.
    pub fn add_target(
        mut self,
        id: RenderTargetId,
        image: ImageId,
        clear: ClearValue,
        store: AttachmentStoreOp,
    ) -> Self {
        self.color.push(RenderTarget {
            id,
            image,
            load: AttachmentLoadOp::Clear,
            clear: Some(clear),
            store,
        });
        self
    }

    /// Adds a color target whose previous contents are preserved.
    pub fn add_target_load(
        mut self,
        id: RenderTargetId,
        image: ImageId,
        store: AttachmentStoreOp,
    ) -> Self {
        self.color.push(RenderTarget {
            id,
            image,
            load: AttachmentLoadOp::Load,
            clear: None,
            store,
        });
        self
    }

    pub fn set_depth_target(
        mut self,
        image: ImageId,
        clear: Option<ClearValue>,
        store: AttachmentStoreOp,
    ) -> Self {
        self.depth = Some(RenderTarget {
            id: RenderTargetId::depth(),
            image,
            load: if clear.is_some() {
                AttachmentLoadOp::Clear
            } else {
                AttachmentLoadOp::Load
            },
            clear,
            store,
        });
        self
    }

    pub fn add_viewport(mut self, viewport: impl Into<Viewport>) -> Self {
        self.viewports.push(viewport.into());
        self
    }

    pub fn add_scissor(mut self, scissor: ScissorRect) -> Self {
        self.scissors.push(scissor);
        self
    }
}

pub(crate) struct LogicalPass {
    pub desc: RenderPassDesc,
    pub draws: Vec<DrawCall>,
    pub submitted: bool,
}

/// Payload of one task node.
pub(crate) enum TaskKind {
    DispatchCompute {
        pipeline: RawId,
        sets: BoundSets,
        push_constants: Vec<PushConstantData>,
        group_count: [u32; 3],
    },
    CopyImage {
        src: RawId,
        dst: RawId,
        regions: Vec<ImageCopy>,
    },
    CopyBuffer {
        src: RawId,
        dst: RawId,
        regions: Vec<BufferCopy>,
    },
    BlitImage {
        src: RawId,
        dst: RawId,
        filter: BlitFilter,
        regions: Vec<ImageBlit>,
    },
    UpdateImage {
        dst: RawId,
        offset: [i32; 3],
        extent: [u32; 3],
        subresource: ImageSubresourceLayers,
        data: Vec<u8>,
    },
    UpdateBuffer {
        dst: RawId,
        offset: u64,
        data: Vec<u8>,
    },
    ReadImage {
        src: RawId,
        offset: [i32; 3],
        extent: [u32; 3],
        subresource: ImageSubresourceLayers,
        callback: Option<ImageReadCallback>,
    },
    ReadBuffer {
        src: RawId,
        offset: u64,
        size: u64,
        callback: Option<BufferReadCallback>,
    },
    ClearImage {
        dst: RawId,
        value: ClearValue,
        range: ImageSubresourceRange,
    },
    ClearBuffer {
        dst: RawId,
        offset: u64,
        size: u64,
        value: u32,
    },
    SubmitRenderPass {
        pass: LogicalPassId,
    },
    PresentImage {
        swapchain: RawId,
        image: RawId,
    },
    BuildRayTracingGeometry {
        dst: RawId,
        scratch: Option<RawId>,
    },
    TraceRays {
        pipeline: RawId,
        sets: BoundSets,
        push_constants: Vec<PushConstantData>,
        extent: [u32; 3],
    },
    /// Join node: carries dependencies only.
    Group,
}

impl TaskKind {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            TaskKind::DispatchCompute { .. } => "DispatchCompute",
            TaskKind::CopyImage { .. } => "CopyImage",
            TaskKind::CopyBuffer { .. } => "CopyBuffer",
            TaskKind::BlitImage { .. } => "BlitImage",
            TaskKind::UpdateImage { .. } => "UpdateImage",
            TaskKind::UpdateBuffer { .. } => "UpdateBuffer",
            TaskKind::ReadImage { .. } => "ReadImage",
            TaskKind::ReadBuffer { .. } => "ReadBuffer",
            TaskKind::ClearImage { .. } => "ClearImage",
            TaskKind::ClearBuffer { .. } => "ClearBuffer",
            TaskKind::SubmitRenderPass { .. } => "SubmitRenderPass",
            TaskKind::PresentImage { .. } => "PresentImage",
            TaskKind::BuildRayTracingGeometry { .. } => "BuildRayTracingGeometry",
            TaskKind::TraceRays { .. } => "TraceRays",
            TaskKind::Group => "Group",
        }
    }
}

pub(crate) struct TaskNode {
    pub name: Option<String>,
    pub kind: TaskKind,
    pub accesses: SmallVec<[ResourceAccess; 8]>,
    pub depends_on: SmallVec<[TaskId; 4]>,
    /// Invalid tasks recorded a validation warning; they are kept for
    /// diagnostics but skipped at emission.
    pub invalid: bool,
    pub debug_trace: Option<[u32; 3]>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RecordState {
    Recording,
    Executing,
}

/// Decrements the graph's recording counter when the buffer dies.
pub(crate) struct RecordingGuard(pub(crate) Arc<::std::sync::atomic::AtomicU32>);

impl Drop for RecordingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, ::std::sync::atomic::Ordering::AcqRel);
    }
}

/// Accumulates the task graph for one frame slice on one logical queue.
pub struct CommandBuffer {
    pub(crate) desc: CommandBufferDesc,
    pub(crate) manager: Arc<ResourceManager>,
    pub(crate) tasks: Vec<TaskNode>,
    pub(crate) passes: Vec<LogicalPass>,
    pub(crate) wait_for: Vec<BatchToken>,
    pub(crate) state: RecordState,
    /// Validation warnings recorded while staying resilient.
    pub(crate) diagnostics: Vec<String>,
    #[allow(dead_code)]
    pub(crate) guard: Option<RecordingGuard>,
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("name", &self.desc.name)
            .field("tasks", &self.tasks.len())
            .field("passes", &self.passes.len())
            .finish()
    }
}

impl CommandBuffer {
    pub(crate) fn new(
        desc: CommandBufferDesc,
        manager: Arc<ResourceManager>,
        wait_for: Vec<BatchToken>,
        guard: Option<RecordingGuard>,
    ) -> CommandBuffer {
        CommandBuffer {
            desc,
            manager,
            tasks: Vec::new(),
            passes: Vec::new(),
            wait_for,
            state: RecordState::Recording,
            diagnostics: Vec::new(),
            guard,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.desc.name.as_deref()
    }

    pub fn queue(&self) -> QueueKind {
        self.desc.queue
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Validation warnings collected so far (stale handles etc.).
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    fn ensure_recording(&self) -> Result<()> {
        if self.state != RecordState::Recording {
            return Err(Error::ValidationFailed(
                "command buffer is no longer recording".to_owned(),
            ));
        }
        Ok(())
    }

    fn warn(&mut self, message: String) {
        log::warn!("{}: {}", self.desc.name.as_deref().unwrap_or("<cmd>"), message);
        self.diagnostics.push(message);
    }

    fn check_task_ids(&self, deps: &[TaskId]) -> Result<()> {
        for dep in deps {
            if dep.0 as usize >= self.tasks.len() {
                return Err(Error::ValidationFailed(format!(
                    "depends_on references unknown task {:?}",
                    dep
                )));
            }
        }
        Ok(())
    }

    fn push_task(&mut self, node: TaskNode) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(node);
        id
    }

    /// Records one task. Returns its id for use in `depends_on` edges.
    pub fn task<T: FrameTask>(&mut self, task: T) -> Result<TaskId> {
        self.ensure_recording()?;
        let node = task.into_node(self)?;
        self.check_task_ids(&node.depends_on)?;
        Ok(self.push_task(node))
    }

    /// Opens a logical render pass; draws are recorded into it with
    /// [`draw`] and the pass is scheduled by a [`SubmitRenderPass`] task.
    ///
    /// [`draw`]: CommandBuffer::draw
    pub fn create_render_pass(&mut self, desc: RenderPassDesc) -> Result<LogicalPassId> {
        self.ensure_recording()?;
        if desc.color.is_empty() && desc.depth.is_none() {
            return Err(Error::ValidationFailed(
                "render pass has no attachments".to_owned(),
            ));
        }
        for target in desc.color.iter().chain(desc.depth.as_ref()) {
            if !self.manager.contains(target.image.raw()) {
                self.warn(format!(
                    "render target {:?} references invalid image {:?}",
                    target.id,
                    target.image.raw()
                ));
            }
        }
        let id = LogicalPassId(self.passes.len() as u32);
        self.passes.push(LogicalPass {
            desc,
            draws: Vec::new(),
            submitted: false,
        });
        Ok(id)
    }

    /// Records one draw into a logical pass. Draw order inside the pass is
    /// the declaration order and is never reordered.
    pub fn draw<D: PassTask>(&mut self, pass: LogicalPassId, draw: D) -> Result<()> {
        self.ensure_recording()?;
        let call = draw.into_draw(self)?;
        let pass = self
            .passes
            .get_mut(pass.0 as usize)
            .ok_or_else(|| Error::ValidationFailed("unknown render pass".to_owned()))?;
        if pass.submitted {
            return Err(Error::ValidationFailed(
                "render pass was already submitted".to_owned(),
            ));
        }
        pass.draws.push(call.0);
        Ok(())
    }

    pub(crate) fn finish_recording(&mut self) {
        self.state = RecordState::Executing;
    }

    // -- validation helpers -------------------------------------------------

    fn resolve_sets(
        &mut self,
        pipeline: RawId,
        bound: &[(DescriptorSetId, PipelineResources)],
    ) -> Result<BoundSets> {
        let table = self
            .manager
            .pipeline_table_for(pipeline)
            .ok_or(Error::InvalidHandle(pipeline))?;
        let records = table.read();
        let record = records.get(pipeline)?;
        let mut sets = BoundSets::new();
        for (name, resources) in bound {
            if !resources.is_initialized() {
                return Err(Error::ValidationFailed(format!(
                    "pipeline resources for set {:?} were never initialized",
                    name
                )));
            }
            if !resources.unknown_uniforms().is_empty() {
                return Err(Error::ValidationFailed(format!(
                    "unknown uniforms bound on set {:?}: {:?}",
                    name,
                    resources.unknown_uniforms()
                )));
            }
            let set = record
                .sets
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| {
                    Error::ValidationFailed(format!("pipeline has no descriptor set {:?}", name))
                })?;
            for unbound in resources.unbound_uniforms() {
                log::warn!("descriptor {:?} of set {:?} is unbound", unbound, name);
            }
            sets.push((set.index, resources.clone()));
        }
        Ok(sets)
    }

    fn resolve_push_constants(
        &mut self,
        pipeline: RawId,
        push: &[(PushConstantId, Vec<u8>)],
    ) -> Result<Vec<PushConstantData>> {
        if push.is_empty() {
            return Ok(Vec::new());
        }
        let table = self
            .manager
            .pipeline_table_for(pipeline)
            .ok_or(Error::InvalidHandle(pipeline))?;
        let records = table.read();
        let record = records.get(pipeline)?;
        let mut out = Vec::with_capacity(push.len());
        for (id, data) in push {
            let range = record
                .push_constants
                .iter()
                .find(|r| &r.id == id)
                .ok_or_else(|| {
                    Error::ValidationFailed(format!("pipeline has no push constant {:?}", id))
                })?;
            if data.len() as u32 > range.size {
                return Err(Error::ValidationFailed(format!(
                    "push constant {:?}: {} bytes exceed the declared {}",
                    id,
                    data.len(),
                    range.size
                )));
            }
            out.push(PushConstantData {
                id: id.clone(),
                stages: range.stages,
                offset: range.offset,
                data: data.clone(),
            });
        }
        Ok(out)
    }

    fn set_accesses(&self, sets: &BoundSets, accesses: &mut SmallVec<[ResourceAccess; 8]>) {
        for (_, resources) in sets {
            for (resource, access, stage, layout) in resources.declared_accesses() {
                accesses.push(ResourceAccess {
                    resource,
                    access,
                    stage,
                    layout,
                    range: None,
                });
            }
        }
    }
}

/// Implemented by every recordable task payload.
pub trait FrameTask {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode>;
}

/// Implemented by draw payloads recordable inside a logical render pass.
pub trait PassTask {
    fn into_draw(self, cmd: &mut CommandBuffer) -> Result<DrawCallToken>;
}

/// Opaque wrapper so `DrawCall` internals stay crate-private.
pub struct DrawCallToken(pub(crate) DrawCall);

// ---------------------------------------------------------------------------
// Task builders

/// Common fluent tail carried by every builder.
#[derive(Default)]
struct TaskCommon {
    name: Option<String>,
    depends_on: SmallVec<[TaskId; 4]>,
}

macro_rules! common_methods {
    () => {
        pub fn name(mut self, name: &str) -> Self {
            self.common.name = Some(name.to_owned());
            self
        }

        pub fn depends_on(mut self, task: TaskId) -> Self {
            self.common.depends_on.push(task);
            self
        }
    };
}

/// Compute dispatch.
#[derive(Default)]
pub struct DispatchCompute {
    common: TaskCommon,
    pipeline: CPipelineId,
    resources: Vec<(DescriptorSetId, PipelineResources)>,
    push_constants: Vec<(PushConstantId, Vec<u8>)>,
    group_count: [u32; 3],
    debug_trace: Option<[u32; 3]>,
}

impl DispatchCompute {
    pub fn new() -> DispatchCompute {
        DispatchCompute {
            group_count: [1, 1, 1],
            ..Default::default()
        }
    }

    common_methods!();

    pub fn pipeline(mut self, pipeline: CPipelineId) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn add_resources(
        mut self,
        set: impl Into<DescriptorSetId>,
        resources: &PipelineResources,
    ) -> Self {
        self.resources.push((set.into(), resources.clone()));
        self
    }

    pub fn add_push_constant(mut self, id: impl Into<PushConstantId>, data: &[u8]) -> Self {
        self.push_constants.push((id.into(), data.to_vec()));
        self
    }

    pub fn dispatch(mut self, group_count: [u32; 2]) -> Self {
        self.group_count = [group_count[0], group_count[1], 1];
        self
    }

    pub fn dispatch_3d(mut self, group_count: [u32; 3]) -> Self {
        self.group_count = group_count;
        self
    }

    /// Requests a shader debug trace of the invocation at `coord`; requires
    /// an instrumented pipeline and `DebugFlags::SHADER_TRACE`.
    pub fn enable_debug_trace(mut self, coord: [u32; 3]) -> Self {
        self.debug_trace = Some(coord);
        self
    }
}

impl FrameTask for DispatchCompute {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        if !self.pipeline.valid() {
            return Err(Error::InvalidHandle(self.pipeline.raw()));
        }
        let sets = cmd.resolve_sets(self.pipeline.raw(), &self.resources)?;
        let push_constants = cmd.resolve_push_constants(self.pipeline.raw(), &self.push_constants)?;
        let mut accesses = SmallVec::new();
        cmd.set_accesses(&sets, &mut accesses);
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::DispatchCompute {
                pipeline: self.pipeline.raw(),
                sets,
                push_constants,
                group_count: self.group_count,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid: false,
            debug_trace: self.debug_trace,
        })
    }
}

/// Image-to-image copy.
#[derive(Default)]
pub struct CopyImage {
    common: TaskCommon,
    src: ImageId,
    dst: ImageId,
    regions: Vec<ImageCopy>,
}

impl CopyImage {
    pub fn new() -> CopyImage {
        Default::default()
    }

    common_methods!();

    pub fn from(mut self, src: ImageId) -> Self {
        self.src = src;
        self
    }

    pub fn to(mut self, dst: ImageId) -> Self {
        self.dst = dst;
        self
    }

    pub fn add_region(
        mut self,
        src_subresource: ImageSubresourceLayers,
        src_offset: [i32; 3],
        dst_subresource: ImageSubresourceLayers,
        dst_offset: [i32; 3],
        extent: [u32; 3],
    ) -> Self {
        self.regions.push(ImageCopy {
            src_subresource,
            src_offset,
            dst_subresource,
            dst_offset,
            extent,
        });
        self
    }
}

impl FrameTask for CopyImage {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let mut invalid = false;
        for (what, id) in [("source", self.src.raw()), ("destination", self.dst.raw())].iter() {
            if !cmd.manager.contains(*id) {
                cmd.warn(format!("CopyImage {} handle {:?} is invalid", what, id));
                invalid = true;
            }
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_read_image(self.src.raw()));
            accesses.push(transfer_write_image(self.dst.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::CopyImage {
                src: self.src.raw(),
                dst: self.dst.raw(),
                regions: self.regions,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Buffer-to-buffer copy.
#[derive(Default)]
pub struct CopyBuffer {
    common: TaskCommon,
    src: BufferId,
    dst: BufferId,
    regions: Vec<BufferCopy>,
}

impl CopyBuffer {
    pub fn new() -> CopyBuffer {
        Default::default()
    }

    common_methods!();

    pub fn from(mut self, src: BufferId) -> Self {
        self.src = src;
        self
    }

    pub fn to(mut self, dst: BufferId) -> Self {
        self.dst = dst;
        self
    }

    pub fn add_region(mut self, src_offset: u64, dst_offset: u64, size: u64) -> Self {
        self.regions.push(BufferCopy {
            src_offset,
            dst_offset,
            size,
        });
        self
    }
}

impl FrameTask for CopyBuffer {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let mut invalid = false;
        for (what, id) in [("source", self.src.raw()), ("destination", self.dst.raw())].iter() {
            if !cmd.manager.contains(*id) {
                cmd.warn(format!("CopyBuffer {} handle {:?} is invalid", what, id));
                invalid = true;
            }
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_read_buffer(self.src.raw()));
            accesses.push(transfer_write_buffer(self.dst.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::CopyBuffer {
                src: self.src.raw(),
                dst: self.dst.raw(),
                regions: self.regions,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Scaled image blit.
#[derive(Default)]
pub struct BlitImage {
    common: TaskCommon,
    src: ImageId,
    dst: ImageId,
    filter: Option<BlitFilter>,
    regions: Vec<ImageBlit>,
}

impl BlitImage {
    pub fn new() -> BlitImage {
        Default::default()
    }

    common_methods!();

    pub fn from(mut self, src: ImageId) -> Self {
        self.src = src;
        self
    }

    pub fn to(mut self, dst: ImageId) -> Self {
        self.dst = dst;
        self
    }

    pub fn filter(mut self, filter: BlitFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn add_region(
        mut self,
        src_subresource: ImageSubresourceLayers,
        src_bounds: [[i32; 3]; 2],
        dst_subresource: ImageSubresourceLayers,
        dst_bounds: [[i32; 3]; 2],
    ) -> Self {
        self.regions.push(ImageBlit {
            src_subresource,
            src_bounds,
            dst_subresource,
            dst_bounds,
        });
        self
    }
}

impl FrameTask for BlitImage {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let mut invalid = false;
        for (what, id) in [("source", self.src.raw()), ("destination", self.dst.raw())].iter() {
            if !cmd.manager.contains(*id) {
                cmd.warn(format!("BlitImage {} handle {:?} is invalid", what, id));
                invalid = true;
            }
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_read_image(self.src.raw()));
            accesses.push(transfer_write_image(self.dst.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::BlitImage {
                src: self.src.raw(),
                dst: self.dst.raw(),
                filter: self.filter.unwrap_or(BlitFilter::Nearest),
                regions: self.regions,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Host-to-image upload through the staging ring.
#[derive(Default)]
pub struct UpdateImage {
    common: TaskCommon,
    dst: ImageId,
    offset: [i32; 3],
    extent: [u32; 3],
    subresource: ImageSubresourceLayers,
    data: Vec<u8>,
}

impl UpdateImage {
    pub fn new() -> UpdateImage {
        Default::default()
    }

    common_methods!();

    pub fn image(mut self, dst: ImageId) -> Self {
        self.dst = dst;
        self
    }

    pub fn region(mut self, offset: [i32; 3], extent: [u32; 3]) -> Self {
        self.offset = offset;
        self.extent = extent;
        self
    }

    pub fn subresource(mut self, subresource: ImageSubresourceLayers) -> Self {
        self.subresource = subresource;
        self
    }

    /// Tightly packed texel data for the region.
    pub fn data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }
}

impl FrameTask for UpdateImage {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let mut invalid = false;
        match cmd.manager.image_desc(self.dst) {
            Err(_) => {
                cmd.warn(format!(
                    "UpdateImage destination handle {:?} is invalid",
                    self.dst.raw()
                ));
                invalid = true;
            }
            Ok(desc) => {
                let expected = u64::from(self.extent[0])
                    * u64::from(self.extent[1])
                    * u64::from(self.extent[2].max(1))
                    * u64::from(desc.format.texel_size());
                if expected != self.data.len() as u64 {
                    return Err(Error::ValidationFailed(format!(
                        "UpdateImage data is {} bytes, region needs {}",
                        self.data.len(),
                        expected
                    )));
                }
            }
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_write_image(self.dst.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::UpdateImage {
                dst: self.dst.raw(),
                offset: self.offset,
                extent: self.extent,
                subresource: self.subresource,
                data: self.data,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Host-to-buffer upload through the staging ring.
#[derive(Default)]
pub struct UpdateBuffer {
    common: TaskCommon,
    dst: BufferId,
    offset: u64,
    data: Vec<u8>,
}

impl UpdateBuffer {
    pub fn new() -> UpdateBuffer {
        Default::default()
    }

    common_methods!();

    pub fn buffer(mut self, dst: BufferId, offset: u64) -> Self {
        self.dst = dst;
        self.offset = offset;
        self
    }

    pub fn data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }
}

impl FrameTask for UpdateBuffer {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let mut invalid = false;
        if !cmd.manager.contains(self.dst.raw()) {
            cmd.warn(format!(
                "UpdateBuffer destination handle {:?} is invalid",
                self.dst.raw()
            ));
            invalid = true;
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_write_buffer(self.dst.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::UpdateBuffer {
                dst: self.dst.raw(),
                offset: self.offset,
                data: self.data,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Image download; the callback fires after the frame's fence signals.
#[derive(Default)]
pub struct ReadImage {
    common: TaskCommon,
    src: ImageId,
    offset: [i32; 3],
    extent: [u32; 3],
    subresource: ImageSubresourceLayers,
    callback: Option<ImageReadCallback>,
}

impl ReadImage {
    pub fn new() -> ReadImage {
        Default::default()
    }

    common_methods!();

    pub fn image(mut self, src: ImageId, offset: [i32; 3], extent: [u32; 2]) -> Self {
        self.src = src;
        self.offset = offset;
        self.extent = [extent[0], extent[1], 1];
        self
    }

    pub fn subresource(mut self, subresource: ImageSubresourceLayers) -> Self {
        self.subresource = subresource;
        self
    }

    pub fn callback(
        mut self,
        callback: impl FnOnce(crate::staging::ReadbackStatus, &crate::image::ImageView<'_>)
            + Send
            + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl FrameTask for ReadImage {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        if self.callback.is_none() {
            return Err(Error::ValidationFailed(
                "ReadImage without a callback".to_owned(),
            ));
        }
        let mut invalid = false;
        if !cmd.manager.contains(self.src.raw()) {
            cmd.warn(format!(
                "ReadImage source handle {:?} is invalid",
                self.src.raw()
            ));
            invalid = true;
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_read_image(self.src.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::ReadImage {
                src: self.src.raw(),
                offset: self.offset,
                extent: self.extent,
                subresource: self.subresource,
                callback: self.callback,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Buffer download; the callback fires after the frame's fence signals.
#[derive(Default)]
pub struct ReadBuffer {
    common: TaskCommon,
    src: BufferId,
    offset: u64,
    size: u64,
    callback: Option<BufferReadCallback>,
}

impl ReadBuffer {
    pub fn new() -> ReadBuffer {
        Default::default()
    }

    common_methods!();

    pub fn buffer(mut self, src: BufferId, offset: u64, size: u64) -> Self {
        self.src = src;
        self.offset = offset;
        self.size = size;
        self
    }

    pub fn callback(
        mut self,
        callback: impl FnOnce(crate::staging::ReadbackStatus, &crate::buffer::BufferView<'_>)
            + Send
            + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl FrameTask for ReadBuffer {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        if self.callback.is_none() {
            return Err(Error::ValidationFailed(
                "ReadBuffer without a callback".to_owned(),
            ));
        }
        let mut invalid = false;
        if !cmd.manager.contains(self.src.raw()) {
            cmd.warn(format!(
                "ReadBuffer source handle {:?} is invalid",
                self.src.raw()
            ));
            invalid = true;
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_read_buffer(self.src.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::ReadBuffer {
                src: self.src.raw(),
                offset: self.offset,
                size: self.size,
                callback: self.callback,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Clears an image outside a render pass.
#[derive(Default)]
pub struct ClearImage {
    common: TaskCommon,
    dst: ImageId,
    value: Option<ClearValue>,
    range: Option<ImageSubresourceRange>,
}

impl ClearImage {
    pub fn new() -> ClearImage {
        Default::default()
    }

    common_methods!();

    pub fn image(mut self, dst: ImageId) -> Self {
        self.dst = dst;
        self
    }

    pub fn color(mut self, value: [f32; 4]) -> Self {
        self.value = Some(ClearValue::Color(value));
        self
    }

    pub fn depth_stencil(mut self, depth: f32, stencil: u32) -> Self {
        self.value = Some(ClearValue::DepthStencil { depth, stencil });
        self
    }

    pub fn range(mut self, range: ImageSubresourceRange) -> Self {
        self.range = Some(range);
        self
    }
}

impl FrameTask for ClearImage {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let mut invalid = false;
        let range = match cmd.manager.image_desc(self.dst) {
            Ok(desc) => self
                .range
                .unwrap_or_else(|| ImageSubresourceRange::whole(&desc)),
            Err(_) => {
                cmd.warn(format!(
                    "ClearImage destination handle {:?} is invalid",
                    self.dst.raw()
                ));
                invalid = true;
                Default::default()
            }
        };
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_write_image(self.dst.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::ClearImage {
                dst: self.dst.raw(),
                value: self.value.unwrap_or(ClearValue::Color([0.0; 4])),
                range,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Fills a buffer range with a 32-bit pattern.
#[derive(Default)]
pub struct ClearBuffer {
    common: TaskCommon,
    dst: BufferId,
    offset: u64,
    size: u64,
    value: u32,
}

impl ClearBuffer {
    pub fn new() -> ClearBuffer {
        Default::default()
    }

    common_methods!();

    pub fn buffer(mut self, dst: BufferId, offset: u64, size: u64) -> Self {
        self.dst = dst;
        self.offset = offset;
        self.size = size;
        self
    }

    pub fn value(mut self, value: u32) -> Self {
        self.value = value;
        self
    }
}

impl FrameTask for ClearBuffer {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let mut invalid = false;
        if !cmd.manager.contains(self.dst.raw()) {
            cmd.warn(format!(
                "ClearBuffer destination handle {:?} is invalid",
                self.dst.raw()
            ));
            invalid = true;
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_write_buffer(self.dst.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::ClearBuffer {
                dst: self.dst.raw(),
                offset: self.offset,
                size: self.size,
                value: self.value,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Schedules a recorded logical render pass.
pub struct SubmitRenderPass {
    common: TaskCommon,
    pass: LogicalPassId,
}

impl SubmitRenderPass {
    pub fn new(pass: LogicalPassId) -> SubmitRenderPass {
        SubmitRenderPass {
            common: Default::default(),
            pass,
        }
    }

    common_methods!();
}

impl FrameTask for SubmitRenderPass {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let pass = cmd
            .passes
            .get_mut(self.pass.0 as usize)
            .ok_or_else(|| Error::ValidationFailed("unknown render pass".to_owned()))?;
        if pass.submitted {
            return Err(Error::ValidationFailed(
                "render pass was already submitted".to_owned(),
            ));
        }
        pass.submitted = true;

        let mut accesses: SmallVec<[ResourceAccess; 8]> = SmallVec::new();
        for target in pass.desc.color.iter() {
            accesses.push(ResourceAccess {
                resource: target.image.raw(),
                access: AccessFlags::COLOR_ATTACHMENT_WRITE
                    | if target.load == AttachmentLoadOp::Load {
                        AccessFlags::COLOR_ATTACHMENT_READ
                    } else {
                        AccessFlags::empty()
                    },
                stage: StageFlags::COLOR_ATTACHMENT_OUTPUT,
                layout: Some(ImageLayout::ColorAttachment),
                range: None,
            });
        }
        if let Some(depth) = &pass.desc.depth {
            accesses.push(ResourceAccess {
                resource: depth.image.raw(),
                access: AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
                stage: StageFlags::EARLY_FRAGMENT_TESTS | StageFlags::LATE_FRAGMENT_TESTS,
                layout: Some(ImageLayout::DepthStencilAttachment),
                range: None,
            });
        }
        // Resources read by the pass's draws.
        let mut draw_accesses: SmallVec<[ResourceAccess; 8]> = SmallVec::new();
        for draw in &pass.draws {
            match draw {
                DrawCall::Vertices(DrawVerticesCall {
                    sets,
                    vertex_buffers,
                    ..
                })
                | DrawCall::Indexed(DrawIndexedCall {
                    sets,
                    vertex_buffers,
                    ..
                }) => {
                    for (resource, access, stage, layout) in
                        sets.iter().flat_map(|(_, r)| r.declared_accesses())
                    {
                        draw_accesses.push(ResourceAccess {
                            resource,
                            access,
                            stage,
                            layout,
                            range: None,
                        });
                    }
                    for (buffer, _) in vertex_buffers {
                        draw_accesses.push(ResourceAccess {
                            resource: *buffer,
                            access: AccessFlags::VERTEX_ATTRIBUTE_READ,
                            stage: StageFlags::VERTEX_INPUT,
                            layout: None,
                            range: None,
                        });
                    }
                    if let DrawCall::Indexed(call) = draw {
                        draw_accesses.push(ResourceAccess {
                            resource: call.index_buffer.0,
                            access: AccessFlags::INDEX_READ,
                            stage: StageFlags::VERTEX_INPUT,
                            layout: None,
                            range: None,
                        });
                    }
                }
                DrawCall::Meshes(DrawMeshesCall { sets, .. }) => {
                    for (resource, access, stage, layout) in
                        sets.iter().flat_map(|(_, r)| r.declared_accesses())
                    {
                        draw_accesses.push(ResourceAccess {
                            resource,
                            access,
                            stage,
                            layout,
                            range: None,
                        });
                    }
                }
                DrawCall::Custom { accesses, .. } => {
                    draw_accesses.extend(accesses.iter().cloned());
                }
            }
        }
        accesses.extend(draw_accesses);

        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::SubmitRenderPass { pass: self.pass },
            accesses,
            depends_on: self.common.depends_on,
            invalid: false,
            debug_trace: None,
        })
    }
}

/// Presents an image to a swapchain.
pub struct PresentImage {
    common: TaskCommon,
    swapchain: SwapchainId,
    image: ImageId,
}

impl PresentImage {
    pub fn new(swapchain: SwapchainId, image: ImageId) -> PresentImage {
        PresentImage {
            common: Default::default(),
            swapchain,
            image,
        }
    }

    common_methods!();
}

impl FrameTask for PresentImage {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let mut invalid = false;
        if !cmd.manager.contains(self.swapchain.raw()) {
            cmd.warn(format!(
                "PresentImage swapchain handle {:?} is invalid",
                self.swapchain.raw()
            ));
            invalid = true;
        }
        if !cmd.manager.contains(self.image.raw()) {
            cmd.warn(format!(
                "PresentImage source handle {:?} is invalid",
                self.image.raw()
            ));
            invalid = true;
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(transfer_read_image(self.image.raw()));
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::PresentImage {
                swapchain: self.swapchain.raw(),
                image: self.image.raw(),
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Builds (or refits) ray-tracing acceleration data into a buffer.
#[derive(Default)]
pub struct BuildRayTracingGeometry {
    common: TaskCommon,
    dst: BufferId,
    scratch: Option<BufferId>,
}

impl BuildRayTracingGeometry {
    pub fn new() -> BuildRayTracingGeometry {
        Default::default()
    }

    common_methods!();

    pub fn target(mut self, dst: BufferId) -> Self {
        self.dst = dst;
        self
    }

    pub fn scratch(mut self, scratch: BufferId) -> Self {
        self.scratch = Some(scratch);
        self
    }
}

impl FrameTask for BuildRayTracingGeometry {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        let mut invalid = false;
        if !cmd.manager.contains(self.dst.raw()) {
            cmd.warn(format!(
                "BuildRayTracingGeometry target handle {:?} is invalid",
                self.dst.raw()
            ));
            invalid = true;
        }
        let mut accesses = SmallVec::new();
        if !invalid {
            accesses.push(ResourceAccess {
                resource: self.dst.raw(),
                access: AccessFlags::ACCELERATION_STRUCTURE_WRITE,
                stage: StageFlags::ACCELERATION_STRUCTURE_BUILD,
                layout: None,
                range: None,
            });
        }
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::BuildRayTracingGeometry {
                dst: self.dst.raw(),
                scratch: self.scratch.map(|s| s.raw()),
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid,
            debug_trace: None,
        })
    }
}

/// Ray dispatch.
#[derive(Default)]
pub struct TraceRays {
    common: TaskCommon,
    pipeline: RtPipelineId,
    resources: Vec<(DescriptorSetId, PipelineResources)>,
    push_constants: Vec<(PushConstantId, Vec<u8>)>,
    extent: [u32; 3],
}

impl TraceRays {
    pub fn new() -> TraceRays {
        TraceRays {
            extent: [1, 1, 1],
            ..Default::default()
        }
    }

    common_methods!();

    pub fn pipeline(mut self, pipeline: RtPipelineId) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn add_resources(
        mut self,
        set: impl Into<DescriptorSetId>,
        resources: &PipelineResources,
    ) -> Self {
        self.resources.push((set.into(), resources.clone()));
        self
    }

    pub fn add_push_constant(mut self, id: impl Into<PushConstantId>, data: &[u8]) -> Self {
        self.push_constants.push((id.into(), data.to_vec()));
        self
    }

    pub fn extent(mut self, extent: [u32; 3]) -> Self {
        self.extent = extent;
        self
    }
}

impl FrameTask for TraceRays {
    fn into_node(self, cmd: &mut CommandBuffer) -> Result<TaskNode> {
        if !self.pipeline.valid() {
            return Err(Error::InvalidHandle(self.pipeline.raw()));
        }
        let sets = cmd.resolve_sets(self.pipeline.raw(), &self.resources)?;
        let push_constants = cmd.resolve_push_constants(self.pipeline.raw(), &self.push_constants)?;
        let mut accesses = SmallVec::new();
        cmd.set_accesses(&sets, &mut accesses);
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::TraceRays {
                pipeline: self.pipeline.raw(),
                sets,
                push_constants,
                extent: self.extent,
            },
            accesses,
            depends_on: self.common.depends_on,
            invalid: false,
            debug_trace: None,
        })
    }
}

/// Join node over a set of tasks; useful to give one id to a batch of work.
#[derive(Default)]
pub struct Group {
    common: TaskCommon,
}

impl Group {
    pub fn new() -> Group {
        Default::default()
    }

    common_methods!();
}

impl FrameTask for Group {
    fn into_node(self, _cmd: &mut CommandBuffer) -> Result<TaskNode> {
        Ok(TaskNode {
            name: self.common.name,
            kind: TaskKind::Group,
            accesses: SmallVec::new(),
            depends_on: self.common.depends_on,
            invalid: false,
            debug_trace: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Draw builders (recorded inside logical render passes)

/// Non-indexed draw.
#[derive(Default)]
pub struct DrawVertices {
    pipeline: GPipelineId,
    resources: Vec<(DescriptorSetId, PipelineResources)>,
    push_constants: Vec<(PushConstantId, Vec<u8>)>,
    vertex_buffers: SmallVec<[(RawId, u64); 2]>,
    vertex_count: u32,
    instance_count: u32,
    first_vertex: u32,
    scissor: Option<ScissorRect>,
}

impl DrawVertices {
    pub fn new() -> DrawVertices {
        DrawVertices {
            instance_count: 1,
            ..Default::default()
        }
    }

    pub fn pipeline(mut self, pipeline: GPipelineId) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn draw(mut self, vertex_count: u32) -> Self {
        self.vertex_count = vertex_count;
        self
    }

    pub fn instances(mut self, instance_count: u32) -> Self {
        self.instance_count = instance_count;
        self
    }

    pub fn first_vertex(mut self, first_vertex: u32) -> Self {
        self.first_vertex = first_vertex;
        self
    }

    pub fn add_resources(
        mut self,
        set: impl Into<DescriptorSetId>,
        resources: &PipelineResources,
    ) -> Self {
        self.resources.push((set.into(), resources.clone()));
        self
    }

    pub fn add_push_constant(mut self, id: impl Into<PushConstantId>, data: &[u8]) -> Self {
        self.push_constants.push((id.into(), data.to_vec()));
        self
    }

    pub fn add_vertex_buffer(mut self, buffer: BufferId, offset: u64) -> Self {
        self.vertex_buffers.push((buffer.raw(), offset));
        self
    }

    /// Per-draw scissor override.
    pub fn scissor(mut self, scissor: ScissorRect) -> Self {
        self.scissor = Some(scissor);
        self
    }
}

impl PassTask for DrawVertices {
    fn into_draw(self, cmd: &mut CommandBuffer) -> Result<DrawCallToken> {
        if !self.pipeline.valid() {
            return Err(Error::InvalidHandle(self.pipeline.raw()));
        }
        let sets = cmd.resolve_sets(self.pipeline.raw(), &self.resources)?;
        let push_constants = cmd.resolve_push_constants(self.pipeline.raw(), &self.push_constants)?;
        Ok(DrawCallToken(DrawCall::Vertices(DrawVerticesCall {
            pipeline: self.pipeline.raw(),
            sets,
            push_constants,
            vertex_buffers: self.vertex_buffers,
            vertex_count: self.vertex_count,
            instance_count: self.instance_count,
            first_vertex: self.first_vertex,
            first_instance: 0,
            scissor: self.scissor,
        })))
    }
}

/// Indexed draw.
#[derive(Default)]
pub struct DrawIndexed {
    pipeline: GPipelineId,
    resources: Vec<(DescriptorSetId, PipelineResources)>,
    push_constants: Vec<(PushConstantId, Vec<u8>)>,
    vertex_buffers: SmallVec<[(RawId, u64); 2]>,
    index_buffer: Option<(BufferId, u64, bool)>,
    index_count: u32,
    instance_count: u32,
    first_index: u32,
    vertex_offset: i32,
    scissor: Option<ScissorRect>,
}

impl DrawIndexed {
    pub fn new() -> DrawIndexed {
        DrawIndexed {
            instance_count: 1,
            ..Default::default()
        }
    }

    pub fn pipeline(mut self, pipeline: GPipelineId) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn draw(mut self, index_count: u32) -> Self {
        self.index_count = index_count;
        self
    }

    pub fn index_buffer(mut self, buffer: BufferId, offset: u64, sixteen_bit: bool) -> Self {
        self.index_buffer = Some((buffer, offset, sixteen_bit));
        self
    }

    pub fn add_vertex_buffer(mut self, buffer: BufferId, offset: u64) -> Self {
        self.vertex_buffers.push((buffer.raw(), offset));
        self
    }

    pub fn add_resources(
        mut self,
        set: impl Into<DescriptorSetId>,
        resources: &PipelineResources,
    ) -> Self {
        self.resources.push((set.into(), resources.clone()));
        self
    }

    pub fn add_push_constant(mut self, id: impl Into<PushConstantId>, data: &[u8]) -> Self {
        self.push_constants.push((id.into(), data.to_vec()));
        self
    }

    pub fn scissor(mut self, scissor: ScissorRect) -> Self {
        self.scissor = Some(scissor);
        self
    }
}

impl PassTask for DrawIndexed {
    fn into_draw(self, cmd: &mut CommandBuffer) -> Result<DrawCallToken> {
        if !self.pipeline.valid() {
            return Err(Error::InvalidHandle(self.pipeline.raw()));
        }
        let index_buffer = self.index_buffer.ok_or_else(|| {
            Error::ValidationFailed("DrawIndexed without an index buffer".to_owned())
        })?;
        let sets = cmd.resolve_sets(self.pipeline.raw(), &self.resources)?;
        let push_constants = cmd.resolve_push_constants(self.pipeline.raw(), &self.push_constants)?;
        Ok(DrawCallToken(DrawCall::Indexed(DrawIndexedCall {
            pipeline: self.pipeline.raw(),
            sets,
            push_constants,
            vertex_buffers: self.vertex_buffers,
            index_buffer: (index_buffer.0.raw(), index_buffer.1, index_buffer.2),
            index_count: self.index_count,
            instance_count: self.instance_count,
            first_index: self.first_index,
            vertex_offset: self.vertex_offset,
            first_instance: 0,
            scissor: self.scissor,
        })))
    }
}

/// Mesh-shading draw.
#[derive(Default)]
pub struct DrawMeshes {
    pipeline: MPipelineId,
    resources: Vec<(DescriptorSetId, PipelineResources)>,
    push_constants: Vec<(PushConstantId, Vec<u8>)>,
    group_count: [u32; 3],
    scissor: Option<ScissorRect>,
}

impl DrawMeshes {
    pub fn new() -> DrawMeshes {
        DrawMeshes {
            group_count: [1, 1, 1],
            ..Default::default()
        }
    }

    pub fn pipeline(mut self, pipeline: MPipelineId) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn dispatch(mut self, group_count: [u32; 3]) -> Self {
        self.group_count = group_count;
        self
    }

    pub fn add_resources(
        mut self,
        set: impl Into<DescriptorSetId>,
        resources: &PipelineResources,
    ) -> Self {
        self.resources.push((set.into(), resources.clone()));
        self
    }

    pub fn add_push_constant(mut self, id: impl Into<PushConstantId>, data: &[u8]) -> Self {
        self.push_constants.push((id.into(), data.to_vec()));
        self
    }

    pub fn scissor(mut self, scissor: ScissorRect) -> Self {
        self.scissor = Some(scissor);
        self
    }
}

impl PassTask for DrawMeshes {
    fn into_draw(self, cmd: &mut CommandBuffer) -> Result<DrawCallToken> {
        if !self.pipeline.valid() {
            return Err(Error::InvalidHandle(self.pipeline.raw()));
        }
        let sets = cmd.resolve_sets(self.pipeline.raw(), &self.resources)?;
        let push_constants = cmd.resolve_push_constants(self.pipeline.raw(), &self.push_constants)?;
        Ok(DrawCallToken(DrawCall::Meshes(DrawMeshesCall {
            pipeline: self.pipeline.raw(),
            sets,
            push_constants,
            group_count: self.group_count,
            scissor: self.scissor,
        })))
    }
}

/// Client-recorded draw commands; the callback runs at emission time inside
/// the surrounding render pass.
pub struct CustomDraw {
    callback: Option<CustomDrawCallback>,
    accesses: Vec<ResourceAccess>,
}

impl Default for CustomDraw {
    fn default() -> Self {
        CustomDraw {
            callback: None,
            accesses: Vec::new(),
        }
    }
}

impl CustomDraw {
    pub fn new(
        callback: impl FnOnce(&mut CustomDrawContext<'_>) -> Result<()> + Send + 'static,
    ) -> CustomDraw {
        CustomDraw {
            callback: Some(Box::new(callback)),
            accesses: Vec::new(),
        }
    }

    /// Declares a resource the callback will touch, so the solver can fence
    /// it like any other access.
    pub fn add_image_access(
        mut self,
        image: ImageId,
        access: AccessFlags,
        stage: StageFlags,
        layout: ImageLayout,
    ) -> Self {
        self.accesses.push(ResourceAccess {
            resource: image.raw(),
            access,
            stage,
            layout: Some(layout),
            range: None,
        });
        self
    }
}

impl PassTask for CustomDraw {
    fn into_draw(self, _cmd: &mut CommandBuffer) -> Result<DrawCallToken> {
        let callback = self.callback.ok_or_else(|| {
            Error::ValidationFailed("CustomDraw without a callback".to_owned())
        })?;
        Ok(DrawCallToken(DrawCall::Custom {
            callback,
            accesses: self.accesses,
        }))
    }
}

// ---------------------------------------------------------------------------

fn transfer_read_image(resource: RawId) -> ResourceAccess {
    ResourceAccess {
        resource,
        access: AccessFlags::TRANSFER_READ,
        stage: StageFlags::TRANSFER,
        layout: Some(ImageLayout::TransferSrc),
        range: None,
    }
}

fn transfer_write_image(resource: RawId) -> ResourceAccess {
    ResourceAccess {
        resource,
        access: AccessFlags::TRANSFER_WRITE,
        stage: StageFlags::TRANSFER,
        layout: Some(ImageLayout::TransferDst),
        range: None,
    }
}

fn transfer_read_buffer(resource: RawId) -> ResourceAccess {
    ResourceAccess {
        resource,
        access: AccessFlags::TRANSFER_READ,
        stage: StageFlags::TRANSFER,
        layout: None,
        range: None,
    }
}

fn transfer_write_buffer(resource: RawId) -> ResourceAccess {
    ResourceAccess {
        resource,
        access: AccessFlags::TRANSFER_WRITE,
        stage: StageFlags::TRANSFER,
        layout: None,
        range: None,
    }
}

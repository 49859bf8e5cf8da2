//! The task processor: linearizes one command buffer and inserts
//! synchronization.
//!
//! The solver builds a DAG over the recorded tasks (explicit `depends_on`
//! edges plus the implicit writer → readers → next-writer order induced by
//! declared resource accesses), computes a stable topological order, then
//! walks every access against the per-resource tracking state to emit the
//! minimal set of pipeline barriers, layout transitions and queue ownership
//! transfers. The output is a linear driver command stream plus everything
//! the submission batcher needs to wire semaphores and retirement.
//!
//! The walk runs on shadow copies of the access states; the caller reconciles
//! them into the resource manager under the submission lock after the batch
//! is handed to the driver.

use crate::buffer::BufferDesc;
use crate::command::{
    CommandBuffer, CustomDrawContext, DrawCall, LogicalPass, ResourceAccess, TaskKind, TaskNode,
};
use crate::driver::{
    AttachmentDesc, BufferCopy, BufferImageCopy, ClearValue, CmdBufferBarrier, CmdImageBarrier,
    CmdPipelineBarrier, CmdScissor, CmdViewport, DriverCmd, ImageCopy, PipelineBindPoint,
    RenderPassDesc as DriverRenderPassDesc,
};
use crate::error::{Error, Result};
use crate::format::FormatAspect;
use crate::handle::{ImageId, RawId, ResourceKind};
use crate::image::{ImageSubresourceLayers, ImageSubresourceRange};
use crate::pipeline::cache::PipelineCache;
use crate::pipeline::resources::PipelineResources;
use crate::pipeline::ScissorRect;
use crate::resource::{AccessState, ResourceManager};
use crate::staging::{DownloadRegion, DownloadTarget, StagingManager, StagingSlice};
use crate::sync::{is_write_access, AccessFlags, ImageLayout, QueueKind, StageFlags};
use fxhash::FxHashMap;
use petgraph::graph::NodeIndex;
use petgraph::{Directed, Direction, Graph};
use smallvec::SmallVec;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Counters reported per executed command buffer.
#[derive(Copy, Clone, Debug, Default)]
pub struct SolverStats {
    pub tasks: u32,
    pub skipped_tasks: u32,
    pub barriers: u32,
    pub layout_transitions: u32,
    pub queue_transfers: u32,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

/// A queue-ownership release that must run on the producer queue before this
/// buffer's acquire side executes.
pub(crate) struct QueueRelease {
    pub queue: QueueKind,
    pub barrier: CmdPipelineBarrier,
}

/// Present issued by this buffer; the batcher threads the semaphores.
pub(crate) struct PresentRequest {
    pub swapchain: RawId,
    pub image_index: u32,
}

/// A shader debug trace pending decode after the frame retires.
pub(crate) struct TraceRequest {
    pub slice: StagingSlice,
    pub task_name: String,
    pub shader_name: String,
    pub stage: crate::pipeline::ShaderStageFlags,
}

/// Everything the solver produces for one command buffer.
pub(crate) struct CompiledCommands {
    pub queue: QueueKind,
    pub ops: Vec<DriverCmd>,
    pub releases: Vec<QueueRelease>,
    pub updated_states: Vec<(RawId, AccessState)>,
    pub downloads: Vec<DownloadRegion>,
    pub presents: Vec<PresentRequest>,
    pub traces: Vec<TraceRequest>,
    pub dump: Option<String>,
    pub stats: SolverStats,
}

/// Swapchain images acquired by the façade before solving, keyed by the
/// swapchain's raw handle.
pub(crate) type AcquiredImages = FxHashMap<RawId, u32>;

struct Shadow {
    states: FxHashMap<RawId, AccessState>,
    /// Last member of each alias group that touched the shared memory.
    alias_owner: FxHashMap<u32, RawId>,
}

/// Pending barriers for the current task, merged by `(src, dst)` stage pair.
#[derive(Default)]
struct BarrierBatch {
    merged: Vec<CmdPipelineBarrier>,
}

impl BarrierBatch {
    fn slot(&mut self, src: StageFlags, dst: StageFlags) -> &mut CmdPipelineBarrier {
        debug_assert!(!src.is_empty() && !dst.is_empty());
        if let Some(i) = self
            .merged
            .iter()
            .position(|b| b.src_stage_mask == src && b.dst_stage_mask == dst)
        {
            return &mut self.merged[i];
        }
        self.merged.push(CmdPipelineBarrier {
            src_stage_mask: src,
            dst_stage_mask: dst,
            ..Default::default()
        });
        self.merged.last_mut().unwrap()
    }

    fn flush(&mut self, ops: &mut Vec<DriverCmd>, stats: &mut SolverStats) -> Vec<CmdPipelineBarrier> {
        let mut emitted = Vec::new();
        for barrier in self.merged.drain(..) {
            if barrier.memory.is_empty() && barrier.buffers.is_empty() && barrier.images.is_empty()
            {
                continue;
            }
            stats.barriers += 1;
            stats.layout_transitions += barrier
                .images
                .iter()
                .filter(|b| b.old_layout != b.new_layout)
                .count() as u32;
            emitted.push(barrier.clone());
            ops.push(DriverCmd::Barrier(barrier));
        }
        emitted
    }
}

pub(crate) struct TaskProcessor<'a> {
    manager: &'a Arc<ResourceManager>,
    cache: &'a PipelineCache,
    staging: &'a StagingManager,
    frame_slot: usize,
    serial_base: u64,
}

impl<'a> TaskProcessor<'a> {
    pub fn new(
        manager: &'a Arc<ResourceManager>,
        cache: &'a PipelineCache,
        staging: &'a StagingManager,
        frame_slot: usize,
        serial_base: u64,
    ) -> TaskProcessor<'a> {
        TaskProcessor {
            manager,
            cache,
            staging,
            frame_slot,
            serial_base,
        }
    }

    pub fn process(
        &self,
        mut cmd: CommandBuffer,
        acquired: &AcquiredImages,
    ) -> Result<CompiledCommands> {
        let queue = cmd.desc.queue;
        let markers = cmd.desc.debug.contains(crate::command::DebugFlags::MARKERS);
        let shader_trace = cmd
            .desc
            .debug
            .contains(crate::command::DebugFlags::SHADER_TRACE);
        let dump_graph = cmd
            .desc
            .debug
            .contains(crate::command::DebugFlags::DUMP_GRAPH);

        let (graph, order) = self.linearize(&cmd)?;

        let mut shadow = Shadow {
            states: FxHashMap::default(),
            alias_owner: FxHashMap::default(),
        };
        let mut out = CompiledCommands {
            queue,
            ops: Vec::new(),
            releases: Vec::new(),
            updated_states: Vec::new(),
            downloads: Vec::new(),
            presents: Vec::new(),
            traces: Vec::new(),
            dump: None,
            stats: SolverStats::default(),
        };
        let mut dump_barriers: Vec<(u32, Vec<CmdPipelineBarrier>)> = Vec::new();

        let passes = std::mem::replace(&mut cmd.passes, Vec::new());
        let mut passes: Vec<Option<LogicalPass>> = passes.into_iter().map(Some).collect();

        for &node in &order {
            let task_index = graph[node];
            // Split the borrow: the task is moved out so its payload
            // (callbacks, upload bytes) can be consumed.
            let task = &mut cmd.tasks[task_index as usize];
            out.stats.tasks += 1;
            if task.invalid {
                out.stats.skipped_tasks += 1;
                continue;
            }

            let serial = self.serial_base + u64::from(task_index);
            let mut batch = BarrierBatch::default();
            self.hazard_checks(task);
            // Attachment barriers of a render pass are hoisted into its
            // initial layouts instead of standalone transitions.
            let is_pass = matches!(task.kind, TaskKind::SubmitRenderPass { .. });
            let mut hoisted: FxHashMap<RawId, ImageLayout> = FxHashMap::default();
            for access in task.accesses.clone() {
                let hoist = if is_pass { Some(&mut hoisted) } else { None };
                self.resolve_access(&mut shadow, queue, serial, &access, hoist, &mut batch, &mut out)?;
            }
            let emitted = batch.flush(&mut out.ops, &mut out.stats);
            if dump_graph && !emitted.is_empty() {
                dump_barriers.push((task_index, emitted));
            }

            if markers {
                let label = task
                    .name
                    .clone()
                    .unwrap_or_else(|| task.kind.kind_name().to_owned());
                out.ops.push(DriverCmd::BeginDebugGroup(label));
            }
            self.emit_task(
                task,
                &mut passes,
                acquired,
                &mut shadow,
                &hoisted,
                shader_trace,
                &mut out,
            )?;
            if markers {
                out.ops.push(DriverCmd::EndDebugGroup);
            }
        }

        out.updated_states = shadow.states.into_iter().collect();
        if dump_graph {
            out.dump = Some(crate::debug::dump_graph(
                cmd.desc.name.as_deref(),
                &cmd.tasks,
                &graph,
                &order,
                &dump_barriers,
                &cmd.diagnostics,
            ));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Ordering

    /// Builds the dependency graph and returns a stable topological order:
    /// ties are broken by insertion order, matching the client's intent.
    fn linearize(
        &self,
        cmd: &CommandBuffer,
    ) -> Result<(Graph<u32, (), Directed, u32>, Vec<NodeIndex<u32>>)> {
        let mut graph: Graph<u32, (), Directed, u32> = Graph::new();
        let nodes: Vec<NodeIndex<u32>> =
            (0..cmd.tasks.len()).map(|i| graph.add_node(i as u32)).collect();

        // Explicit edges.
        for (index, task) in cmd.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                graph.update_edge(nodes[dep.0 as usize], nodes[index], ());
            }
        }

        // Resource-induced edges: writer -> readers -> next writer.
        struct Uses {
            last_writer: Option<usize>,
            readers: SmallVec<[usize; 4]>,
        }
        let mut uses: FxHashMap<RawId, Uses> = FxHashMap::default();
        for (index, task) in cmd.tasks.iter().enumerate() {
            for access in &task.accesses {
                let entry = uses.entry(access.resource).or_insert(Uses {
                    last_writer: None,
                    readers: SmallVec::new(),
                });
                if is_write_access(access.access) {
                    if let Some(writer) = entry.last_writer {
                        if writer != index {
                            graph.update_edge(nodes[writer], nodes[index], ());
                        }
                    }
                    for &reader in &entry.readers {
                        if reader != index {
                            graph.update_edge(nodes[reader], nodes[index], ());
                        }
                    }
                    entry.last_writer = Some(index);
                    entry.readers.clear();
                } else {
                    if let Some(writer) = entry.last_writer {
                        if writer != index {
                            graph.update_edge(nodes[writer], nodes[index], ());
                        }
                    }
                    entry.readers.push(index);
                }
            }
        }

        // Kahn's algorithm with a min-heap on the insertion index.
        let mut indegree: Vec<usize> = nodes
            .iter()
            .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut heap: BinaryHeap<std::cmp::Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| std::cmp::Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(std::cmp::Reverse(i)) = heap.pop() {
            order.push(nodes[i]);
            for succ in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
                let si = graph[succ] as usize;
                indegree[si] -= 1;
                if indegree[si] == 0 {
                    heap.push(std::cmp::Reverse(si));
                }
            }
        }
        if order.len() != nodes.len() {
            return Err(Error::ValidationFailed(
                "task graph contains a dependency cycle".to_owned(),
            ));
        }
        Ok((graph, order))
    }

    /// Debug-build lint: a task declaring conflicting accesses on the same
    /// resource needs an explicit client barrier; flag it, don't fail.
    fn hazard_checks(&self, task: &TaskNode) {
        if !cfg!(debug_assertions) {
            return;
        }
        for (i, a) in task.accesses.iter().enumerate() {
            for b in task.accesses.iter().skip(i + 1) {
                if a.resource == b.resource
                    && a.layout.is_some()
                    && b.layout.is_some()
                    && a.layout != b.layout
                {
                    log::warn!(
                        "HazardDetected: task {:?} uses {:?} in layouts {:?} and {:?} at once",
                        task.name.as_deref().unwrap_or(task.kind.kind_name()),
                        a.resource,
                        a.layout,
                        b.layout
                    );
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Access walk

    fn initial_state(&self, resource: RawId) -> AccessState {
        self.manager.access_state(resource).unwrap_or_default()
    }

    fn resolve_access(
        &self,
        shadow: &mut Shadow,
        queue: QueueKind,
        serial: u64,
        access: &ResourceAccess,
        hoist: Option<&mut FxHashMap<RawId, ImageLayout>>,
        batch: &mut BarrierBatch,
        out: &mut CompiledCommands,
    ) -> Result<()> {
        let is_image = access.resource.kind_bits() == ResourceKind::Image as u8;

        // Aliased transient memory: fence off the previous member on handoff.
        if is_image {
            if let Some(group) = self.manager.image_alias_group(access.resource) {
                let owner = shadow.alias_owner.insert(group, access.resource);
                if let Some(prev_member) = owner {
                    if prev_member != access.resource {
                        let slot = batch.slot(StageFlags::ALL_COMMANDS, access.stage);
                        slot.memory.push(crate::sync::MemoryBarrier {
                            src_access_mask: AccessFlags::MEMORY_WRITE,
                            dst_access_mask: AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE,
                        });
                        // The incoming member starts undefined.
                        shadow
                            .states
                            .entry(access.resource)
                            .or_insert_with(|| self.initial_state(access.resource))
                            .layout = ImageLayout::Undefined;
                    }
                }
            }
        }

        let prev = *shadow
            .states
            .entry(access.resource)
            .or_insert_with(|| self.initial_state(access.resource));

        let new_layout = access.layout.unwrap_or(prev.layout);
        let layout_change = is_image && new_layout != prev.layout;
        let used_before = !prev.access.is_empty() || prev.layout != ImageLayout::Undefined;
        let queue_change = used_before && prev.queue != queue;
        let write = is_write_access(access.access);
        let prev_wrote = is_write_access(prev.access);

        // Hoisted attachment: the render pass performs the transition via its
        // initial layout; only a visibility barrier is emitted if the
        // previous access was a write.
        let is_attachment = is_image
            && (new_layout == ImageLayout::ColorAttachment
                || new_layout == ImageLayout::DepthStencilAttachment);
        if let (Some(hoist), true, false) = (hoist, is_attachment, queue_change) {
            hoist.insert(access.resource, prev.layout);
            if prev_wrote {
                let src_stage = if prev.stage.is_empty() {
                    StageFlags::TOP_OF_PIPE
                } else {
                    prev.stage
                };
                let slot = batch.slot(src_stage, access.stage);
                slot.images.push(CmdImageBarrier {
                    image: self.manager.image_device(access.resource)?,
                    src_access_mask: prev.access,
                    dst_access_mask: access.access,
                    old_layout: prev.layout,
                    new_layout: prev.layout,
                    src_queue: queue,
                    dst_queue: queue,
                    range: access
                        .range
                        .unwrap_or_else(|| self.whole_image_range(access.resource)),
                });
            }
            let state = shadow.states.get_mut(&access.resource).unwrap();
            state.access = access.access;
            state.stage = access.stage;
            state.layout = new_layout;
            state.queue = queue;
            state.writer = Some(serial);
            return Ok(());
        }

        if queue_change {
            self.queue_transfer(access, &prev, queue, new_layout, batch, out)?;
        } else if prev_wrote || layout_change {
            // Write -> any, or a transition: full memory dependency.
            let src_stage = if prev.stage.is_empty() {
                StageFlags::TOP_OF_PIPE
            } else {
                prev.stage
            };
            let slot = batch.slot(src_stage, access.stage);
            if is_image {
                slot.images.push(CmdImageBarrier {
                    image: self.manager.image_device(access.resource)?,
                    src_access_mask: if prev_wrote {
                        prev.access
                    } else {
                        AccessFlags::empty()
                    },
                    dst_access_mask: access.access,
                    old_layout: prev.layout,
                    new_layout,
                    src_queue: queue,
                    dst_queue: queue,
                    range: access.range.unwrap_or_else(|| {
                        self.whole_image_range(access.resource)
                    }),
                });
            } else {
                slot.buffers.push(CmdBufferBarrier {
                    buffer: self.manager.buffer_device(access.resource)?,
                    src_access_mask: prev.access,
                    dst_access_mask: access.access,
                    src_queue: queue,
                    dst_queue: queue,
                    offset: 0,
                    size: !0,
                });
            }
        } else if write && !prev.access.is_empty() {
            // Read -> write: execution-only dependency.
            let slot = batch.slot(prev.stage, access.stage);
            slot.memory.push(crate::sync::MemoryBarrier {
                src_access_mask: AccessFlags::empty(),
                dst_access_mask: access.access,
            });
        }

        // Update the shadow state.
        let state = shadow.states.get_mut(&access.resource).unwrap();
        if write || layout_change || queue_change {
            state.access = access.access;
            state.stage = access.stage;
            state.writer = if write { Some(serial) } else { state.writer };
        } else {
            // Read-after-read accumulates.
            state.access |= access.access;
            state.stage |= access.stage;
        }
        state.layout = new_layout;
        state.queue = queue;
        Ok(())
    }

    /// Release on the producer queue, acquire on ours, stitched with a
    /// semaphore by the batcher.
    fn queue_transfer(
        &self,
        access: &ResourceAccess,
        prev: &AccessState,
        queue: QueueKind,
        new_layout: ImageLayout,
        batch: &mut BarrierBatch,
        out: &mut CompiledCommands,
    ) -> Result<()> {
        out.stats.queue_transfers += 1;
        let is_image = access.resource.kind_bits() == ResourceKind::Image as u8;
        let mut release = CmdPipelineBarrier {
            src_stage_mask: prev.stage,
            dst_stage_mask: StageFlags::BOTTOM_OF_PIPE,
            ..Default::default()
        };
        if is_image {
            let device = self.manager.image_device(access.resource)?;
            let range = access
                .range
                .unwrap_or_else(|| self.whole_image_range(access.resource));
            release.images.push(CmdImageBarrier {
                image: device,
                src_access_mask: prev.access,
                dst_access_mask: AccessFlags::empty(),
                old_layout: prev.layout,
                new_layout,
                src_queue: prev.queue,
                dst_queue: queue,
                range,
            });
            let slot = batch.slot(StageFlags::TOP_OF_PIPE, access.stage);
            slot.images.push(CmdImageBarrier {
                image: device,
                src_access_mask: AccessFlags::empty(),
                dst_access_mask: access.access,
                old_layout: prev.layout,
                new_layout,
                src_queue: prev.queue,
                dst_queue: queue,
                range,
            });
        } else {
            let device = self.manager.buffer_device(access.resource)?;
            release.buffers.push(CmdBufferBarrier {
                buffer: device,
                src_access_mask: prev.access,
                dst_access_mask: AccessFlags::empty(),
                src_queue: prev.queue,
                dst_queue: queue,
                offset: 0,
                size: !0,
            });
            let slot = batch.slot(StageFlags::TOP_OF_PIPE, access.stage);
            slot.buffers.push(CmdBufferBarrier {
                buffer: device,
                src_access_mask: AccessFlags::empty(),
                dst_access_mask: access.access,
                src_queue: prev.queue,
                dst_queue: queue,
                offset: 0,
                size: !0,
            });
        }
        out.releases.push(QueueRelease {
            queue: prev.queue,
            barrier: release,
        });
        Ok(())
    }

    fn whole_image_range(&self, resource: RawId) -> ImageSubresourceRange {
        self.manager
            .image_desc(ImageId::from_raw(resource))
            .map(|desc| ImageSubresourceRange::whole(&desc))
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Emission

    fn bind_descriptor_sets(
        &self,
        bind_point: PipelineBindPoint,
        sets: &[(u32, PipelineResources)],
        ops: &mut Vec<DriverCmd>,
    ) -> Result<()> {
        for (index, resources) in sets {
            let set = self
                .cache
                .descriptor_set(self.manager, self.frame_slot, resources)?;
            ops.push(DriverCmd::BindDescriptorSets {
                bind_point,
                first_set: *index,
                sets: vec![set],
            });
        }
        Ok(())
    }

    fn push_constant_ops(
        &self,
        push_constants: &[crate::command::PushConstantData],
        ops: &mut Vec<DriverCmd>,
    ) {
        for pc in push_constants {
            ops.push(DriverCmd::PushConstants {
                stages: pc.stages,
                offset: pc.offset,
                data: pc.data.clone(),
            });
        }
    }

    /// Instrumentation info of a pipeline, if any stage carries a debug-trace
    /// binding: `(set, uniform name, shader name, stages)`.
    fn trace_target(
        &self,
        pipeline: RawId,
    ) -> Result<Option<(u32, crate::names::UniformId, String, crate::pipeline::ShaderStageFlags)>>
    {
        let table = match self.manager.pipeline_table_for(pipeline) {
            Some(table) => table,
            None => return Ok(None),
        };
        let records = table.read();
        let record = records.get(pipeline)?;
        for (i, stage) in record.stages.iter().enumerate() {
            if let Some(binding) = stage.debug_trace_binding {
                let set = record
                    .sets
                    .iter()
                    .find(|s| s.index == binding.set)
                    .and_then(|s| {
                        s.uniforms
                            .iter()
                            .find(|u| u.binding == binding.binding)
                            .map(|u| u.uniform.clone())
                    });
                if let Some(uniform) = set {
                    let shader_name = record
                        .stage_names
                        .get(i)
                        .and_then(|n| n.clone())
                        .unwrap_or_default();
                    return Ok(Some((
                        binding.set,
                        uniform,
                        shader_name,
                        stage.stage.into(),
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Sets up the trace storage buffer for an instrumented dispatch and
    /// returns what the post-dispatch copy needs.
    fn begin_shader_trace(
        &self,
        pipeline: RawId,
        coord: [u32; 3],
        bound: &mut Vec<(u32, PipelineResources)>,
        out: &mut CompiledCommands,
    ) -> Result<Option<(crate::driver::DeviceBuffer, RawId, String, crate::pipeline::ShaderStageFlags)>>
    {
        let (set_index, uniform, shader_name, stages) = match self.trace_target(pipeline)? {
            Some(target) => target,
            None => {
                log::warn!("shader debug trace requested on a non-instrumented pipeline");
                return Ok(None);
            }
        };
        let trace_buffer = self.manager.create_buffer(
            &BufferDesc::new(
                crate::debug::TRACE_BUFFER_SIZE,
                crate::buffer::BufferUsage::STORAGE
                    | crate::buffer::BufferUsage::TRANSFER_SRC
                    | crate::buffer::BufferUsage::TRANSFER_DST,
            ),
            Some("shader-trace"),
        )?;
        let device = self.manager.buffer_device(trace_buffer.raw())?;
        out.ops.push(DriverCmd::UpdateBuffer {
            buffer: device,
            offset: 0,
            data: crate::debug::trace_header(coord),
        });
        out.ops.push(DriverCmd::Barrier(CmdPipelineBarrier {
            src_stage_mask: StageFlags::TRANSFER,
            dst_stage_mask: StageFlags::COMPUTE_SHADER,
            memory: vec![crate::sync::MemoryBarrier {
                src_access_mask: AccessFlags::TRANSFER_WRITE,
                dst_access_mask: AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            }],
            ..Default::default()
        }));
        match bound.iter_mut().find(|(i, _)| *i == set_index) {
            Some((_, resources)) => {
                resources.bind_buffer(uniform, trace_buffer);
            }
            None => {
                let mut resources = PipelineResources::new();
                self.manager
                    .init_pipeline_resources_by_index(&mut resources, pipeline, set_index)?;
                resources.bind_buffer(uniform, trace_buffer);
                bound.push((set_index, resources));
            }
        }
        Ok(Some((device, trace_buffer.raw(), shader_name, stages)))
    }

    fn finish_shader_trace(
        &self,
        task_name: Option<&str>,
        trace: (crate::driver::DeviceBuffer, RawId, String, crate::pipeline::ShaderStageFlags),
        out: &mut CompiledCommands,
    ) -> Result<()> {
        let (device, buffer, shader_name, stages) = trace;
        out.ops.push(DriverCmd::Barrier(CmdPipelineBarrier {
            src_stage_mask: StageFlags::COMPUTE_SHADER,
            dst_stage_mask: StageFlags::TRANSFER,
            memory: vec![crate::sync::MemoryBarrier {
                src_access_mask: AccessFlags::SHADER_WRITE,
                dst_access_mask: AccessFlags::TRANSFER_READ,
            }],
            ..Default::default()
        }));
        let slice = self
            .staging
            .stage_download(self.frame_slot, crate::debug::TRACE_BUFFER_SIZE)?;
        out.ops.push(DriverCmd::CopyBuffer {
            src: device,
            dst: slice.buffer,
            regions: vec![BufferCopy {
                src_offset: 0,
                dst_offset: slice.offset,
                size: crate::debug::TRACE_BUFFER_SIZE,
            }],
        });
        out.traces.push(TraceRequest {
            slice,
            task_name: task_name.unwrap_or_default().to_owned(),
            shader_name,
            stage: stages,
        });
        // The handle dies now; the device object outlives it on the
        // retirement ring.
        self.manager.release(buffer);
        Ok(())
    }

    fn emit_task(
        &self,
        task: &mut TaskNode,
        passes: &mut Vec<Option<LogicalPass>>,
        acquired: &AcquiredImages,
        shadow: &mut Shadow,
        hoisted: &FxHashMap<RawId, ImageLayout>,
        shader_trace: bool,
        out: &mut CompiledCommands,
    ) -> Result<()> {
        let task_name = task.name.clone();
        let debug_trace = task.debug_trace;
        match &mut task.kind {
            TaskKind::Group => {}

            TaskKind::DispatchCompute {
                pipeline,
                sets,
                push_constants,
                group_count,
            } => {
                let device = self.cache.device_pipeline(self.manager, *pipeline, None)?;
                out.ops.push(DriverCmd::BindPipeline {
                    bind_point: PipelineBindPoint::Compute,
                    pipeline: device,
                });
                let mut bound: Vec<(u32, PipelineResources)> =
                    sets.iter().map(|(i, r)| (*i, r.clone())).collect();
                let trace = match debug_trace {
                    Some(coord) if shader_trace => {
                        self.begin_shader_trace(*pipeline, coord, &mut bound, out)?
                    }
                    _ => None,
                };
                self.bind_descriptor_sets(PipelineBindPoint::Compute, &bound, &mut out.ops)?;
                self.push_constant_ops(push_constants, &mut out.ops);
                out.ops.push(DriverCmd::Dispatch {
                    group_count: *group_count,
                });
                if let Some(trace) = trace {
                    self.finish_shader_trace(task_name.as_deref(), trace, out)?;
                }
            }

            TaskKind::SubmitRenderPass { pass } => {
                let pass = passes
                    .get_mut(pass.0 as usize)
                    .and_then(Option::take)
                    .ok_or_else(|| {
                        Error::ValidationFailed("render pass submitted twice".to_owned())
                    })?;
                self.emit_render_pass(pass, hoisted, out)?;
            }

            TaskKind::CopyImage { src, dst, regions } => {
                let src_device = match self.manager.image_device(*src) {
                    Ok(device) => device,
                    Err(_) => return Ok(()),
                };
                let dst_device = self.manager.image_device(*dst)?;
                let regions = if regions.is_empty() {
                    let desc = self.manager.image_desc(ImageId::from_raw(*src))?;
                    vec![ImageCopy {
                        extent: [
                            desc.dimensions.width(),
                            desc.dimensions.height(),
                            desc.dimensions.depth(),
                        ],
                        ..Default::default()
                    }]
                } else {
                    regions.clone()
                };
                out.ops.push(DriverCmd::CopyImage {
                    src: src_device,
                    src_layout: ImageLayout::TransferSrc,
                    dst: dst_device,
                    dst_layout: ImageLayout::TransferDst,
                    regions,
                });
            }

            TaskKind::CopyBuffer { src, dst, regions } => {
                out.ops.push(DriverCmd::CopyBuffer {
                    src: self.manager.buffer_device(*src)?,
                    dst: self.manager.buffer_device(*dst)?,
                    regions: regions.clone(),
                });
            }

            TaskKind::BlitImage {
                src,
                dst,
                filter,
                regions,
            } => {
                out.ops.push(DriverCmd::BlitImage {
                    src: self.manager.image_device(*src)?,
                    src_layout: ImageLayout::TransferSrc,
                    dst: self.manager.image_device(*dst)?,
                    dst_layout: ImageLayout::TransferDst,
                    filter: *filter,
                    regions: regions.clone(),
                });
            }

            TaskKind::UpdateImage {
                dst,
                offset,
                extent,
                subresource,
                data,
            } => {
                let bytes = std::mem::replace(data, Vec::new());
                out.stats.upload_bytes += bytes.len() as u64;
                let slice = self.staging.stage_upload(self.frame_slot, &bytes)?;
                out.ops.push(DriverCmd::CopyBufferToImage {
                    src: slice.buffer,
                    dst: self.manager.image_device(*dst)?,
                    dst_layout: ImageLayout::TransferDst,
                    regions: vec![BufferImageCopy {
                        buffer_offset: slice.offset,
                        buffer_row_length: 0,
                        subresource: *subresource,
                        image_offset: *offset,
                        extent: *extent,
                    }],
                });
            }

            TaskKind::UpdateBuffer { dst, offset, data } => {
                let bytes = std::mem::replace(data, Vec::new());
                out.stats.upload_bytes += bytes.len() as u64;
                let device = self.manager.buffer_device(*dst)?;
                // Small updates go inline; large ones through staging.
                if bytes.len() <= 65536 {
                    out.ops.push(DriverCmd::UpdateBuffer {
                        buffer: device,
                        offset: *offset,
                        data: bytes,
                    });
                } else {
                    let slice = self.staging.stage_upload(self.frame_slot, &bytes)?;
                    out.ops.push(DriverCmd::CopyBuffer {
                        src: slice.buffer,
                        dst: device,
                        regions: vec![BufferCopy {
                            src_offset: slice.offset,
                            dst_offset: *offset,
                            size: bytes.len() as u64,
                        }],
                    });
                }
            }

            TaskKind::ReadImage {
                src,
                offset,
                extent,
                subresource,
                callback,
            } => {
                let desc = self.manager.image_desc(ImageId::from_raw(*src))?;
                let texel = u64::from(desc.format.texel_size());
                let size =
                    u64::from(extent[0]) * u64::from(extent[1]) * u64::from(extent[2]) * texel;
                out.stats.download_bytes += size;
                let slice = self.staging.stage_download(self.frame_slot, size)?;
                out.ops.push(DriverCmd::CopyImageToBuffer {
                    src: self.manager.image_device(*src)?,
                    src_layout: ImageLayout::TransferSrc,
                    dst: slice.buffer,
                    regions: vec![BufferImageCopy {
                        buffer_offset: slice.offset,
                        buffer_row_length: 0,
                        subresource: *subresource,
                        image_offset: *offset,
                        extent: *extent,
                    }],
                });
                out.downloads.push(DownloadRegion {
                    slice,
                    target: DownloadTarget::Image {
                        dimensions: crate::image::Dimensions::Dim2d {
                            width: extent[0],
                            height: extent[1],
                        },
                        format: desc.format,
                        row_pitch: extent[0] as usize * texel as usize,
                        callback: callback.take().ok_or_else(|| {
                            Error::ValidationFailed("ReadImage callback consumed".to_owned())
                        })?,
                    },
                });
            }

            TaskKind::ReadBuffer {
                src,
                offset,
                size,
                callback,
            } => {
                out.stats.download_bytes += *size;
                let slice = self.staging.stage_download(self.frame_slot, *size)?;
                out.ops.push(DriverCmd::CopyBuffer {
                    src: self.manager.buffer_device(*src)?,
                    dst: slice.buffer,
                    regions: vec![BufferCopy {
                        src_offset: *offset,
                        dst_offset: slice.offset,
                        size: *size,
                    }],
                });
                out.downloads.push(DownloadRegion {
                    slice,
                    target: DownloadTarget::Buffer {
                        callback: callback.take().ok_or_else(|| {
                            Error::ValidationFailed("ReadBuffer callback consumed".to_owned())
                        })?,
                    },
                });
            }

            TaskKind::ClearImage { dst, value, range } => {
                let device = self.manager.image_device(*dst)?;
                if range.aspect == FormatAspect::Color {
                    out.ops.push(DriverCmd::ClearColorImage {
                        image: device,
                        layout: ImageLayout::TransferDst,
                        value: *value,
                        ranges: vec![*range],
                    });
                } else {
                    let (depth, stencil) = match *value {
                        ClearValue::DepthStencil { depth, stencil } => (depth, stencil),
                        _ => (0.0, 0),
                    };
                    out.ops.push(DriverCmd::ClearDepthStencilImage {
                        image: device,
                        layout: ImageLayout::TransferDst,
                        depth,
                        stencil,
                        ranges: vec![*range],
                    });
                }
            }

            TaskKind::ClearBuffer {
                dst,
                offset,
                size,
                value,
            } => {
                out.ops.push(DriverCmd::FillBuffer {
                    buffer: self.manager.buffer_device(*dst)?,
                    offset: *offset,
                    size: *size,
                    value: *value,
                });
            }

            TaskKind::PresentImage { swapchain, image } => {
                let index = *acquired.get(swapchain).ok_or_else(|| {
                    Error::ValidationFailed(
                        "PresentImage without an acquired swapchain image".to_owned(),
                    )
                })?;
                let (target, src_desc, dst_desc) = {
                    let swapchains = self.manager.swapchains.read();
                    let record = swapchains.get(*swapchain)?;
                    let target = record.images[index as usize];
                    (
                        target,
                        self.manager.image_desc(ImageId::from_raw(*image))?,
                        self.manager.image_desc(target)?,
                    )
                };
                let src_device = self.manager.image_device(*image)?;
                let dst_device = self.manager.image_device(target.raw())?;
                let dst_range = ImageSubresourceRange::whole(&dst_desc);
                out.ops.push(DriverCmd::Barrier(CmdPipelineBarrier {
                    src_stage_mask: StageFlags::TOP_OF_PIPE,
                    dst_stage_mask: StageFlags::TRANSFER,
                    images: vec![CmdImageBarrier {
                        image: dst_device,
                        src_access_mask: AccessFlags::empty(),
                        dst_access_mask: AccessFlags::TRANSFER_WRITE,
                        old_layout: ImageLayout::Undefined,
                        new_layout: ImageLayout::TransferDst,
                        src_queue: out.queue,
                        dst_queue: out.queue,
                        range: dst_range,
                    }],
                    ..Default::default()
                }));
                out.ops.push(DriverCmd::BlitImage {
                    src: src_device,
                    src_layout: ImageLayout::TransferSrc,
                    dst: dst_device,
                    dst_layout: ImageLayout::TransferDst,
                    filter: crate::driver::BlitFilter::Linear,
                    regions: vec![crate::driver::ImageBlit {
                        src_subresource: ImageSubresourceLayers::default(),
                        src_bounds: [
                            [0, 0, 0],
                            [
                                src_desc.dimensions.width() as i32,
                                src_desc.dimensions.height() as i32,
                                1,
                            ],
                        ],
                        dst_subresource: ImageSubresourceLayers::default(),
                        dst_bounds: [
                            [0, 0, 0],
                            [
                                dst_desc.dimensions.width() as i32,
                                dst_desc.dimensions.height() as i32,
                                1,
                            ],
                        ],
                    }],
                });
                out.ops.push(DriverCmd::Barrier(CmdPipelineBarrier {
                    src_stage_mask: StageFlags::TRANSFER,
                    dst_stage_mask: StageFlags::BOTTOM_OF_PIPE,
                    images: vec![CmdImageBarrier {
                        image: dst_device,
                        src_access_mask: AccessFlags::TRANSFER_WRITE,
                        dst_access_mask: AccessFlags::MEMORY_READ,
                        old_layout: ImageLayout::TransferDst,
                        new_layout: ImageLayout::Present,
                        src_queue: out.queue,
                        dst_queue: out.queue,
                        range: dst_range,
                    }],
                    ..Default::default()
                }));
                shadow.states.insert(
                    target.raw(),
                    AccessState {
                        stage: StageFlags::BOTTOM_OF_PIPE,
                        access: AccessFlags::MEMORY_READ,
                        layout: ImageLayout::Present,
                        queue: out.queue,
                        writer: None,
                    },
                );
                out.presents.push(PresentRequest {
                    swapchain: *swapchain,
                    image_index: index,
                });
            }

            TaskKind::BuildRayTracingGeometry { dst, scratch } => {
                let scratch = scratch.unwrap_or(*dst);
                out.ops.push(DriverCmd::BuildAccelerationStructure {
                    scratch: self.manager.buffer_device(scratch)?,
                });
            }

            TaskKind::TraceRays {
                pipeline,
                sets,
                push_constants,
                extent,
            } => {
                let device = self.cache.device_pipeline(self.manager, *pipeline, None)?;
                out.ops.push(DriverCmd::BindPipeline {
                    bind_point: PipelineBindPoint::RayTracing,
                    pipeline: device,
                });
                let bound: Vec<(u32, PipelineResources)> =
                    sets.iter().map(|(i, r)| (*i, r.clone())).collect();
                self.bind_descriptor_sets(PipelineBindPoint::RayTracing, &bound, &mut out.ops)?;
                self.push_constant_ops(push_constants, &mut out.ops);
                out.ops.push(DriverCmd::TraceRays { extent: *extent });
            }
        }
        Ok(())
    }

    fn emit_render_pass(
        &self,
        pass: LogicalPass,
        hoisted: &FxHashMap<RawId, ImageLayout>,
        out: &mut CompiledCommands,
    ) -> Result<()> {
        let desc = pass.desc;
        let mut attachments = Vec::with_capacity(desc.color.len());
        let mut images = Vec::with_capacity(desc.color.len() + 1);
        let mut clear_values = Vec::with_capacity(desc.color.len() + 1);
        for target in &desc.color {
            let image_desc = match self.manager.image_desc(target.image) {
                Ok(image_desc) => image_desc,
                Err(_) => {
                    // Warned at record time; skip the whole pass.
                    return Ok(());
                }
            };
            attachments.push(AttachmentDesc {
                format: image_desc.format,
                samples: image_desc.samples.0,
                load_op: target.load,
                store_op: target.store,
                initial_layout: hoisted
                    .get(&target.image.raw())
                    .copied()
                    .unwrap_or(ImageLayout::ColorAttachment),
                final_layout: ImageLayout::ColorAttachment,
            });
            images.push(target.image);
            clear_values.push(target.clear.unwrap_or(ClearValue::Color([0.0; 4])));
        }
        let depth_attachment = match &desc.depth {
            Some(target) => {
                let image_desc = match self.manager.image_desc(target.image) {
                    Ok(image_desc) => image_desc,
                    Err(_) => return Ok(()),
                };
                images.push(target.image);
                clear_values.push(
                    target
                        .clear
                        .unwrap_or(ClearValue::DepthStencil {
                            depth: 1.0,
                            stencil: 0,
                        }),
                );
                Some(AttachmentDesc {
                    format: image_desc.format,
                    samples: image_desc.samples.0,
                    load_op: target.load,
                    store_op: target.store,
                    initial_layout: hoisted
                        .get(&target.image.raw())
                        .copied()
                        .unwrap_or(ImageLayout::DepthStencilAttachment),
                    final_layout: ImageLayout::DepthStencilAttachment,
                })
            }
            None => None,
        };
        let driver_desc = DriverRenderPassDesc {
            color_attachments: attachments,
            depth_attachment,
        };
        let render_pass = self.manager.intern_render_pass(&driver_desc)?;
        let framebuffer =
            self.manager
                .intern_framebuffer(render_pass, &images, desc.area.0, desc.area.1)?;
        let device_pass = self.manager.render_passes.read().get(render_pass.raw())?.device;
        let device_framebuffer = self
            .manager
            .framebuffers
            .read()
            .get(framebuffer.raw())?
            .device;

        let full_area = CmdScissor {
            x: 0,
            y: 0,
            width: desc.area.0,
            height: desc.area.1,
        };
        out.ops.push(DriverCmd::BeginRenderPass {
            render_pass: device_pass,
            framebuffer: device_framebuffer,
            render_area: full_area,
            clear_values,
        });

        let viewports: Vec<CmdViewport> = if desc.viewports.is_empty() {
            vec![CmdViewport {
                x: 0.0,
                y: 0.0,
                width: desc.area.0 as f32,
                height: desc.area.1 as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }]
        } else {
            desc.viewports
                .iter()
                .map(|v| CmdViewport {
                    x: v.x.into_inner(),
                    y: v.y.into_inner(),
                    width: v.width.into_inner(),
                    height: v.height.into_inner(),
                    min_depth: v.min_depth.into_inner(),
                    max_depth: v.max_depth.into_inner(),
                })
                .collect()
        };
        let default_scissors: Vec<CmdScissor> = if desc.scissors.is_empty() {
            vec![full_area]
        } else {
            desc.scissors.iter().map(scissor_to_cmd).collect()
        };
        out.ops.push(DriverCmd::SetViewports(viewports));
        out.ops.push(DriverCmd::SetScissors(default_scissors.clone()));

        for draw in pass.draws {
            self.emit_draw(draw, &driver_desc, &default_scissors, out)?;
        }

        out.ops.push(DriverCmd::EndRenderPass);
        Ok(())
    }

    fn emit_draw(
        &self,
        draw: DrawCall,
        compat: &DriverRenderPassDesc,
        default_scissors: &[CmdScissor],
        out: &mut CompiledCommands,
    ) -> Result<()> {
        match draw {
            DrawCall::Vertices(call) => {
                let device = self
                    .cache
                    .device_pipeline(self.manager, call.pipeline, Some(compat))?;
                out.ops.push(DriverCmd::BindPipeline {
                    bind_point: PipelineBindPoint::Graphics,
                    pipeline: device,
                });
                self.bind_descriptor_sets(PipelineBindPoint::Graphics, &call.sets, &mut out.ops)?;
                self.push_constant_ops(&call.push_constants, &mut out.ops);
                self.bind_vertex_buffers(&call.vertex_buffers, &mut out.ops)?;
                let scoped = self.apply_scissor(call.scissor, out);
                out.ops.push(DriverCmd::Draw {
                    vertex_count: call.vertex_count,
                    instance_count: call.instance_count,
                    first_vertex: call.first_vertex,
                    first_instance: call.first_instance,
                });
                if scoped {
                    out.ops
                        .push(DriverCmd::SetScissors(default_scissors.to_vec()));
                }
            }
            DrawCall::Indexed(call) => {
                let device = self
                    .cache
                    .device_pipeline(self.manager, call.pipeline, Some(compat))?;
                out.ops.push(DriverCmd::BindPipeline {
                    bind_point: PipelineBindPoint::Graphics,
                    pipeline: device,
                });
                self.bind_descriptor_sets(PipelineBindPoint::Graphics, &call.sets, &mut out.ops)?;
                self.push_constant_ops(&call.push_constants, &mut out.ops);
                self.bind_vertex_buffers(&call.vertex_buffers, &mut out.ops)?;
                out.ops.push(DriverCmd::BindIndexBuffer {
                    buffer: self.manager.buffer_device(call.index_buffer.0)?,
                    offset: call.index_buffer.1,
                    sixteen_bit: call.index_buffer.2,
                });
                let scoped = self.apply_scissor(call.scissor, out);
                out.ops.push(DriverCmd::DrawIndexed {
                    index_count: call.index_count,
                    instance_count: call.instance_count,
                    first_index: call.first_index,
                    vertex_offset: call.vertex_offset,
                    first_instance: call.first_instance,
                });
                if scoped {
                    out.ops
                        .push(DriverCmd::SetScissors(default_scissors.to_vec()));
                }
            }
            DrawCall::Meshes(call) => {
                let device = self
                    .cache
                    .device_pipeline(self.manager, call.pipeline, Some(compat))?;
                out.ops.push(DriverCmd::BindPipeline {
                    bind_point: PipelineBindPoint::Graphics,
                    pipeline: device,
                });
                self.bind_descriptor_sets(PipelineBindPoint::Graphics, &call.sets, &mut out.ops)?;
                self.push_constant_ops(&call.push_constants, &mut out.ops);
                let scoped = self.apply_scissor(call.scissor, out);
                out.ops.push(DriverCmd::DrawMeshTasks {
                    group_count: call.group_count,
                });
                if scoped {
                    out.ops
                        .push(DriverCmd::SetScissors(default_scissors.to_vec()));
                }
            }
            DrawCall::Custom { callback, .. } => {
                let manager = self.manager;
                let cache = self.cache;
                let resolve = move |raw: RawId| cache.device_pipeline(manager, raw, Some(compat));
                let mut ctx = CustomDrawContext {
                    ops: &mut out.ops,
                    resolve_pipeline: &resolve,
                };
                callback(&mut ctx)?;
            }
        }
        Ok(())
    }

    fn bind_vertex_buffers(
        &self,
        vertex_buffers: &[(RawId, u64)],
        ops: &mut Vec<DriverCmd>,
    ) -> Result<()> {
        if vertex_buffers.is_empty() {
            return Ok(());
        }
        let buffers = vertex_buffers
            .iter()
            .map(|(raw, offset)| Ok((self.manager.buffer_device(*raw)?, *offset)))
            .collect::<Result<Vec<_>>>()?;
        ops.push(DriverCmd::BindVertexBuffers {
            first_binding: 0,
            buffers,
        });
        Ok(())
    }

    fn apply_scissor(&self, scissor: Option<ScissorRect>, out: &mut CompiledCommands) -> bool {
        match scissor {
            Some(scissor) => {
                out.ops
                    .push(DriverCmd::SetScissors(vec![scissor_to_cmd(&scissor)]));
                true
            }
            None => false,
        }
    }
}

fn scissor_to_cmd(scissor: &ScissorRect) -> CmdScissor {
    CmdScissor {
        x: scissor.x,
        y: scissor.y,
        width: scissor.width,
        height: scissor.height,
    }
}

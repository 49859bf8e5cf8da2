//! Test support: a bookkeeping-only driver and a table-driven compiler.
//!
//! The dummy driver mints ids, counts object lifecycles and stores recorded
//! command streams for inspection; it executes nothing and signals fences at
//! submit. Enough to drive the full scheduling pipeline in unit tests.

use crate::buffer::BufferDesc;
use crate::driver::*;
use crate::error::{Error, Result};
use crate::image::ImageDesc;
use crate::memory::MemoryType;
use crate::pipeline::{ShaderReflection, ShaderStage};
use crate::sampler::SamplerDesc;
use crate::sync::QueueKind;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Counters {
    pub images_destroyed: u64,
    pub buffers_destroyed: u64,
    pub descriptor_sets_allocated: u64,
    pub pipelines_created: u64,
    pub submits: u64,
}

#[derive(Default)]
pub struct DummyDriver {
    next_id: AtomicU64,
    pub counters: Mutex<Counters>,
    /// Every recorded command stream, in record order.
    pub recorded: Mutex<Vec<Vec<DriverCmd>>>,
    buffers: Mutex<FxHashMap<u64, Vec<u8>>>,
    fences: Mutex<FxHashMap<u64, bool>>,
}

impl DummyDriver {
    pub fn new() -> Arc<DummyDriver> {
        Arc::new(Default::default())
    }

    fn fresh(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// All recorded ops flattened, for order assertions.
    pub fn all_ops(&self) -> Vec<DriverCmd> {
        self.recorded.lock().iter().flatten().cloned().collect()
    }
}

impl Driver for DummyDriver {
    fn caps(&self) -> DriverCaps {
        DriverCaps {
            features: FeatureFlags::ASYNC_COMPUTE
                | FeatureFlags::TRANSFER_QUEUE
                | FeatureFlags::SHADER_DEBUG_TRACE,
            staging_alignment: 4,
            heap_size: 1 << 20,
        }
    }

    fn allocate_heap(&self, _size: u64, _memory_type: MemoryType) -> Result<DeviceMemory> {
        Ok(DeviceMemory(self.fresh()))
    }

    fn free_heap(&self, _heap: DeviceMemory) {}

    fn create_image(
        &self,
        _desc: &ImageDesc,
        _memory: &MemoryBind,
        _debug_name: Option<&str>,
    ) -> Result<DeviceImage> {
        Ok(DeviceImage(self.fresh()))
    }

    fn destroy_image(&self, _image: DeviceImage) {
        self.counters.lock().images_destroyed += 1;
    }

    fn create_buffer(
        &self,
        desc: &BufferDesc,
        _memory: &MemoryBind,
        _debug_name: Option<&str>,
    ) -> Result<DeviceBuffer> {
        let id = self.fresh();
        self.buffers.lock().insert(id, vec![0; desc.size as usize]);
        Ok(DeviceBuffer(id))
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        self.buffers.lock().remove(&buffer.0);
        self.counters.lock().buffers_destroyed += 1;
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<DeviceSampler> {
        Ok(DeviceSampler(self.fresh()))
    }

    fn destroy_sampler(&self, _sampler: DeviceSampler) {}

    fn write_buffer(&self, buffer: DeviceBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let bytes = buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Error::ValidationFailed("unknown buffer".to_owned()))?;
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: DeviceBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let buffers = self.buffers.lock();
        let bytes = buffers
            .get(&buffer.0)
            .ok_or_else(|| Error::ValidationFailed("unknown buffer".to_owned()))?;
        out.copy_from_slice(&bytes[offset as usize..offset as usize + out.len()]);
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[LayoutBindingDesc],
    ) -> Result<DeviceDescriptorSetLayout> {
        Ok(DeviceDescriptorSetLayout(self.fresh()))
    }

    fn destroy_descriptor_set_layout(&self, _layout: DeviceDescriptorSetLayout) {}

    fn create_render_pass(&self, _desc: &RenderPassDesc) -> Result<DeviceRenderPass> {
        Ok(DeviceRenderPass(self.fresh()))
    }

    fn destroy_render_pass(&self, _render_pass: DeviceRenderPass) {}

    fn create_framebuffer(
        &self,
        _render_pass: DeviceRenderPass,
        _attachments: &[DeviceImage],
        _width: u32,
        _height: u32,
    ) -> Result<DeviceFramebuffer> {
        Ok(DeviceFramebuffer(self.fresh()))
    }

    fn destroy_framebuffer(&self, _framebuffer: DeviceFramebuffer) {}

    fn create_graphics_pipeline(
        &self,
        _info: &GraphicsPipelineCreateInfo<'_>,
    ) -> Result<DevicePipeline> {
        self.counters.lock().pipelines_created += 1;
        Ok(DevicePipeline(self.fresh()))
    }

    fn create_compute_pipeline(
        &self,
        _info: &ComputePipelineCreateInfo<'_>,
    ) -> Result<DevicePipeline> {
        self.counters.lock().pipelines_created += 1;
        Ok(DevicePipeline(self.fresh()))
    }

    fn destroy_pipeline(&self, _pipeline: DevicePipeline) {}

    fn create_descriptor_pool(&self, _max_sets: u32) -> Result<DeviceDescriptorPool> {
        Ok(DeviceDescriptorPool(self.fresh()))
    }

    fn destroy_descriptor_pool(&self, _pool: DeviceDescriptorPool) {}

    fn reset_descriptor_pool(&self, _pool: DeviceDescriptorPool) -> Result<()> {
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        _pool: DeviceDescriptorPool,
        _layout: DeviceDescriptorSetLayout,
    ) -> Result<DeviceDescriptorSet> {
        self.counters.lock().descriptor_sets_allocated += 1;
        Ok(DeviceDescriptorSet(self.fresh()))
    }

    fn update_descriptor_set(
        &self,
        _set: DeviceDescriptorSet,
        _writes: &[DescriptorWrite],
    ) -> Result<()> {
        Ok(())
    }

    fn create_semaphore(&self) -> Result<DeviceSemaphore> {
        Ok(DeviceSemaphore(self.fresh()))
    }

    fn destroy_semaphore(&self, _semaphore: DeviceSemaphore) {}

    fn create_fence(&self) -> Result<DeviceFence> {
        let id = self.fresh();
        self.fences.lock().insert(id, false);
        Ok(DeviceFence(id))
    }

    fn destroy_fence(&self, fence: DeviceFence) {
        self.fences.lock().remove(&fence.0);
    }

    fn fence_signaled(&self, fence: DeviceFence) -> Result<bool> {
        Ok(self.fences.lock().get(&fence.0).copied().unwrap_or(true))
    }

    fn wait_fences(&self, fences: &[DeviceFence], _timeout_ns: u64) -> Result<bool> {
        let known = self.fences.lock();
        Ok(fences.iter().all(|f| known.get(&f.0).copied().unwrap_or(true)))
    }

    fn record(&self, _queue: QueueKind, cmds: &[DriverCmd]) -> Result<DeviceCommandList> {
        self.recorded.lock().push(cmds.to_vec());
        Ok(DeviceCommandList(self.fresh()))
    }

    fn destroy_command_list(&self, _list: DeviceCommandList) {}

    fn submit(&self, _queue: QueueKind, submit: SubmitInfo) -> Result<()> {
        self.counters.lock().submits += 1;
        if let Some(fence) = submit.fence {
            self.fences.lock().insert(fence.0, true);
        }
        Ok(())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
    ) -> Result<(DeviceSwapchain, Vec<DeviceImage>)> {
        let images = (0..desc.image_count.max(1))
            .map(|_| DeviceImage(self.fresh()))
            .collect();
        Ok((DeviceSwapchain(self.fresh()), images))
    }

    fn destroy_swapchain(&self, _swapchain: DeviceSwapchain) {}

    fn acquire_image(
        &self,
        _swapchain: DeviceSwapchain,
        _semaphore: DeviceSemaphore,
    ) -> Result<u32> {
        Ok(0)
    }

    fn present(
        &self,
        _queue: QueueKind,
        _swapchain: DeviceSwapchain,
        _image_index: u32,
        _wait: DeviceSemaphore,
    ) -> Result<()> {
        Ok(())
    }
}

/// Compiler returning canned reflection per registered shader name.
#[derive(Default)]
pub struct TableCompiler {
    entries: Mutex<FxHashMap<String, ShaderReflection>>,
}

impl TableCompiler {
    pub fn new() -> Arc<TableCompiler> {
        Arc::new(Default::default())
    }

    pub fn add(&self, name: &str, reflection: ShaderReflection) {
        self.entries.lock().insert(name.to_owned(), reflection);
    }
}

impl ShaderCompiler for TableCompiler {
    fn compile(
        &self,
        source: &ShaderSource,
        stage: ShaderStage,
        entry_point: &str,
        _features: FeatureFlags,
    ) -> Result<CompiledShader> {
        let name = match source {
            ShaderSource::Text(name) => name.clone(),
            ShaderSource::Bytecode(_) => {
                return Err(Error::CompileFailed("bytecode not supported".to_owned()))
            }
        };
        let reflection = self
            .entries
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::CompileFailed(format!("unknown shader {:?}", name)))?;
        Ok(CompiledShader {
            stage,
            entry_point: entry_point.to_owned(),
            bytecode: Arc::from(vec![0u8; 4].into_boxed_slice()),
            reflection,
            fingerprint: crate::util::content_hash(&name),
            debug_trace_binding: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferUsage;
    use crate::command::{
        CommandBufferDesc, CopyBuffer, DebugFlags, DispatchCompute, Group, ReadBuffer,
        UpdateBuffer,
    };
    use crate::graph::{FrameGraph, FrameGraphConfig};
    use crate::handle::{ImageId, RawId, ResourceKind};
    use crate::image::{ImageDesc, ImageUsage};
    use crate::pipeline::resources::PipelineResources;
    use crate::pipeline::{
        ComputePipelineDesc, DescriptorType, ReflectedBinding, ShaderStageFlags,
    };
    use crate::staging::ReadbackStatus;
    use crate::sync::StageFlags;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn compute_reflection() -> ShaderReflection {
        ShaderReflection {
            bindings: vec![ReflectedBinding {
                set: 0,
                binding: 0,
                uniform: "un_Data".into(),
                descriptor_type: DescriptorType::StorageBuffer,
                count: 1,
                stages: ShaderStageFlags::COMPUTE,
            }],
            local_size: [8, 8, 1],
            ..Default::default()
        }
    }

    fn fixture() -> (Arc<DummyDriver>, FrameGraph) {
        let driver = DummyDriver::new();
        let compiler = TableCompiler::new();
        compiler.add("cs_main", compute_reflection());
        let fg = FrameGraph::new(driver.clone(), compiler, FrameGraphConfig::default()).unwrap();
        (driver, fg)
    }

    fn compute_desc() -> ComputePipelineDesc {
        ComputePipelineDesc::new().shader("main", ShaderSource::Text("cs_main".to_owned()))
    }

    #[test]
    fn pipeline_cache_equivalence() {
        // Two creations from equal descriptors return the same handle.
        let (_driver, fg) = fixture();
        let a = fg.create_compute_pipeline(&compute_desc(), Some("a")).unwrap();
        let b = fg.create_compute_pipeline(&compute_desc(), Some("b")).unwrap();
        assert_eq!(a, b);
        // The second create added a reference: two releases run it down.
        assert_eq!(fg.release_resource(b), 1);
        assert_eq!(fg.release_resource(a), 0);
    }

    #[test]
    fn descriptor_set_idempotence() {
        let (driver, fg) = fixture();
        let pipeline = fg.create_compute_pipeline(&compute_desc(), None).unwrap();
        let buffer = fg
            .create_buffer(&BufferDesc::new(256, BufferUsage::STORAGE), None)
            .unwrap();
        let mut resources = PipelineResources::new();
        assert!(fg.init_pipeline_resources(&mut resources, pipeline, "0"));
        resources.bind_buffer("un_Data", buffer);

        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        cmd.task(
            DispatchCompute::new()
                .pipeline(pipeline)
                .add_resources("0", &resources)
                .dispatch([1, 1]),
        )
        .unwrap();
        cmd.task(
            DispatchCompute::new()
                .pipeline(pipeline)
                .add_resources("0", &resources)
                .dispatch([2, 2]),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        // Same bindings table, same frame: one device set.
        assert_eq!(driver.counters.lock().descriptor_sets_allocated, 1);
    }

    #[test]
    fn destruction_waits_for_retirement() {
        let (driver, fg) = fixture();
        let image = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions((4, 4))
                    .usage(ImageUsage::TRANSFER_SRC),
                None,
            )
            .unwrap();
        assert_eq!(fg.release_resource(image), 0);
        // The handle is dead immediately...
        assert!(fg.image_desc(image).is_err());
        // ...but the driver object lives until a frame retires.
        assert_eq!(driver.counters.lock().images_destroyed, 0);
        assert!(fg.wait_idle());
        assert!(fg.flush());
        assert_eq!(driver.counters.lock().images_destroyed, 1);
    }

    #[test]
    fn stale_handles_mutate_nothing() {
        let (_driver, fg) = fixture();
        let fake = ImageId::from_raw(RawId::from_parts(1111, 7, ResourceKind::Image));
        assert!(matches!(
            fg.image_desc(fake),
            Err(crate::error::Error::InvalidHandle(_))
        ));
        assert!(fg.acquire_resource(fake).is_err());
        assert_eq!(fg.release_resource(fake), 0);
    }

    #[test]
    fn write_read_chain_gets_a_barrier() {
        let (driver, fg) = fixture();
        let buffer = fg
            .create_buffer(
                &BufferDesc::new(
                    64,
                    BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                ),
                None,
            )
            .unwrap();
        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        let write = cmd
            .task(UpdateBuffer::new().buffer(buffer, 0).data(&[1u8; 64]))
            .unwrap();
        cmd.task(
            ReadBuffer::new()
                .buffer(buffer, 0, 64)
                .depends_on(write)
                .callback(|_, _| {}),
        )
        .unwrap();
        assert!(fg.execute(cmd));

        let ops = driver.all_ops();
        let barrier_at = ops.iter().position(|op| match op {
            DriverCmd::Barrier(b) => !b.buffers.is_empty(),
            _ => false,
        });
        let read_copy_at = ops.iter().rposition(|op| matches!(op, DriverCmd::CopyBuffer { .. }));
        let barrier_at = barrier_at.expect("no buffer barrier emitted");
        let read_copy_at = read_copy_at.expect("no read-back copy emitted");
        assert!(barrier_at < read_copy_at);
        // Barrier minimality: no empty stage masks.
        for op in &ops {
            if let DriverCmd::Barrier(b) = op {
                assert!(!b.src_stage_mask.is_empty());
                assert!(!b.dst_stage_mask.is_empty());
            }
        }
        assert!(fg.last_frame_stats().barriers == 0); // not flushed yet
        assert!(fg.flush());
        assert!(fg.last_frame_stats().barriers >= 1);
    }

    #[test]
    fn stable_order_follows_insertion() {
        let (driver, fg) = fixture();
        let mut cmd = fg
            .begin(CommandBufferDesc::new().debug(DebugFlags::MARKERS), &[])
            .unwrap();
        for name in &["first", "second", "third"] {
            cmd.task(Group::new().name(name)).unwrap();
        }
        assert!(fg.execute(cmd));
        let labels: Vec<String> = driver
            .all_ops()
            .iter()
            .filter_map(|op| match op {
                DriverCmd::BeginDebugGroup(label) => Some(label.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec!["first", "second", "third"]);
    }

    #[test]
    fn explicit_dependencies_reorder_emission() {
        let (driver, fg) = fixture();
        let mut cmd = fg
            .begin(CommandBufferDesc::new().debug(DebugFlags::MARKERS), &[])
            .unwrap();
        let early = cmd.task(Group::new().name("early")).unwrap();
        // "late" is recorded second but depends on "early"; order is kept.
        cmd.task(Group::new().name("late").depends_on(early)).unwrap();
        assert!(fg.execute(cmd));
        let labels: Vec<String> = driver
            .all_ops()
            .iter()
            .filter_map(|op| match op {
                DriverCmd::BeginDebugGroup(label) => Some(label.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec!["early", "late"]);
    }

    #[test]
    fn cross_queue_use_emits_release_and_acquire() {
        let (driver, fg) = fixture();
        let buffer = fg
            .create_buffer(
                &BufferDesc::new(64, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST),
                None,
            )
            .unwrap();
        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        cmd.task(UpdateBuffer::new().buffer(buffer, 0).data(&[7u8; 64]))
            .unwrap();
        assert!(fg.execute(cmd));

        let mut cmd = fg
            .begin(
                CommandBufferDesc::new().queue(crate::sync::QueueKind::AsyncCompute),
                &[],
            )
            .unwrap();
        cmd.task(
            ReadBuffer::new()
                .buffer(buffer, 0, 64)
                .callback(|_, _| {}),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        assert!(fg.flush());
        assert_eq!(fg.last_frame_stats().queue_transfers, 1);

        // A release barrier on the producer queue and an acquire on the
        // consumer, both carrying the ownership transfer.
        let transfers: Vec<_> = driver
            .all_ops()
            .iter()
            .filter_map(|op| match op {
                DriverCmd::Barrier(b) => b
                    .buffers
                    .iter()
                    .find(|bb| bb.src_queue != bb.dst_queue)
                    .cloned(),
                _ => None,
            })
            .collect();
        assert_eq!(transfers.len(), 2);
    }

    #[test]
    fn queue_exhaustion_is_reported() {
        let (_driver, fg) = fixture();
        let mut config = FrameGraphConfig::default();
        config.max_recording = 1;
        let driver = DummyDriver::new();
        let compiler = TableCompiler::new();
        let fg2 = FrameGraph::new(driver, compiler, config).unwrap();
        let _a = fg2.begin(CommandBufferDesc::new(), &[]).unwrap();
        assert!(matches!(
            fg2.begin(CommandBufferDesc::new(), &[]),
            Err(crate::error::Error::QueueExhausted)
        ));
        drop(_a);
        assert!(fg2.begin(CommandBufferDesc::new(), &[]).is_ok());
        drop(fg);
    }

    #[test]
    fn callbacks_fire_once_after_wait_idle() {
        let (_driver, fg) = fixture();
        let buffer = fg
            .create_buffer(&BufferDesc::new(16, BufferUsage::TRANSFER_SRC), None)
            .unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        cmd.task(
            ReadBuffer::new()
                .buffer(buffer, 0, 16)
                .callback(move |status, view| {
                    assert_eq!(status, ReadbackStatus::Ok);
                    assert_eq!(view.size(), 16);
                    fired2.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(fg.wait_idle());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(fg.wait_idle());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dump_lists_tasks_and_barriers() {
        let (_driver, fg) = fixture();
        let buffer = fg
            .create_buffer(
                &BufferDesc::new(32, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST),
                None,
            )
            .unwrap();
        let mut cmd = fg
            .begin(
                CommandBufferDesc::new().name("dumped").debug(DebugFlags::DUMP_GRAPH),
                &[],
            )
            .unwrap();
        let write = cmd
            .task(UpdateBuffer::new().buffer(buffer, 0).data(&[0u8; 32]).name("upload"))
            .unwrap();
        cmd.task(
            ReadBuffer::new()
                .buffer(buffer, 0, 32)
                .depends_on(write)
                .callback(|_, _| {}),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        let dump = fg.last_graph_dump().expect("no dump produced");
        assert!(dump.contains("dumped"));
        assert!(dump.contains("upload"));
        assert!(dump.contains("edges:"));
    }

    #[test]
    fn hazard_access_walk_tracks_layouts() {
        // An image first written by transfer, then read by transfer, gets a
        // layout transition TransferDst -> TransferSrc.
        let (driver, fg) = fixture();
        let image = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions((8, 8))
                    .usage(ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST),
                None,
            )
            .unwrap();
        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        let data = vec![0u8; 8 * 8 * 4];
        let up = cmd
            .task(
                crate::command::UpdateImage::new()
                    .image(image)
                    .region([0, 0, 0], [8, 8, 1])
                    .data(&data),
            )
            .unwrap();
        cmd.task(
            crate::command::ReadImage::new()
                .image(image, [0, 0, 0], [8, 8])
                .depends_on(up)
                .callback(|_, _| {}),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        let transitions: Vec<_> = driver
            .all_ops()
            .iter()
            .filter_map(|op| match op {
                DriverCmd::Barrier(b) => b
                    .images
                    .iter()
                    .map(|ib| (ib.old_layout, ib.new_layout))
                    .next(),
                _ => None,
            })
            .collect();
        use crate::sync::ImageLayout::*;
        assert!(transitions.contains(&(Undefined, TransferDst)));
        assert!(transitions.contains(&(TransferDst, TransferSrc)));
    }

    #[test]
    fn hazard_read_to_write_is_execution_only() {
        let (driver, fg) = fixture();
        let buffer = fg
            .create_buffer(
                &BufferDesc::new(64, BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST),
                None,
            )
            .unwrap();
        let other = fg
            .create_buffer(&BufferDesc::new(64, BufferUsage::TRANSFER_DST), None)
            .unwrap();
        let mut cmd = fg.begin(CommandBufferDesc::new(), &[]).unwrap();
        // Read from `buffer`...
        let read = cmd
            .task(CopyBuffer::new().from(buffer).to(other).add_region(0, 0, 64))
            .unwrap();
        // ...then overwrite it: execution dependency, no data visibility
        // needed.
        cmd.task(
            UpdateBuffer::new()
                .buffer(buffer, 0)
                .data(&[1u8; 64])
                .depends_on(read),
        )
        .unwrap();
        assert!(fg.execute(cmd));
        let ops = driver.all_ops();
        let exec_only = ops.iter().any(|op| match op {
            DriverCmd::Barrier(b) => b
                .memory
                .iter()
                .any(|m| m.src_access_mask.is_empty() && !m.dst_access_mask.is_empty()),
            _ => false,
        });
        assert!(exec_only, "expected an execution-only barrier");
    }

    #[test]
    fn auto_resource_releases_on_drop_and_forfeits_on_release() {
        let (_driver, fg) = fixture();
        let image = fg
            .create_image(
                &ImageDesc::new()
                    .dimensions((2, 2))
                    .usage(ImageUsage::TRANSFER_SRC),
                None,
            )
            .unwrap();
        {
            let guard = crate::autores::AutoResource::new(&fg, image);
            assert!(guard.valid());
        }
        // Dropped with its only reference: the handle is stale now.
        assert!(fg.image_desc(image).is_err());

        let buffer = fg
            .create_buffer(&BufferDesc::new(16, BufferUsage::TRANSFER_SRC), None)
            .unwrap();
        let forfeited = crate::autores::AutoResource::new(&fg, buffer).release();
        assert!(fg.buffer_desc(forfeited).is_ok());
        assert_eq!(fg.release_resource(forfeited), 0);
    }

    #[test]
    fn stage_flags_mapping_covers_all_shader_stages() {
        use crate::pipeline::resources::shader_stages_to_pipeline_stages;
        assert_eq!(
            shader_stages_to_pipeline_stages(ShaderStageFlags::COMPUTE),
            StageFlags::COMPUTE_SHADER
        );
        assert_eq!(
            shader_stages_to_pipeline_stages(ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT),
            StageFlags::VERTEX_SHADER | StageFlags::FRAGMENT_SHADER
        );
        // Unknown/empty degrades to the conservative mask.
        assert_eq!(
            shader_stages_to_pipeline_stages(ShaderStageFlags::empty()),
            StageFlags::ALL_COMMANDS
        );
    }
}

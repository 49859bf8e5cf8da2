//! The frame-graph façade: the public entry point of the crate.
//!
//! A [`FrameGraph`] owns the resource manager, pipeline cache, staging rings
//! and submission batcher, and exposes resource CRUD plus the
//! `begin` / `execute` / `flush` / `wait_idle` frame loop. All methods are
//! callable from any thread; command buffers record single-threaded but many
//! may record in parallel.
//!
//! Device loss is terminal: the graph rejects everything except destruction
//! and fires all pending callbacks with `DeviceLost`.

use crate::buffer::BufferDesc;
use crate::command::{CommandBuffer, CommandBufferDesc, RecordingGuard, TaskKind};
use crate::debug::ShaderDebugCallback;
use crate::driver::{Driver, FeatureFlags, ShaderCompiler, SwapchainDesc};
use crate::error::{Error, Result};
use crate::handle::{
    BufferId, CPipelineId, GPipelineId, Id, ImageId, MPipelineId, RawId, ResourceTag,
    RtPipelineId, SamplerId, SwapchainId,
};
use crate::image::ImageDesc;
use crate::names::DescriptorSetId;
use crate::pipeline::cache::PipelineCache;
use crate::pipeline::resources::PipelineResources;
use crate::pipeline::{
    ComputePipelineDesc, GraphicsPipelineDesc, GraphicsState, MeshPipelineDesc,
    RayTracingPipelineDesc,
};
use crate::resource::{PipelineKind, ResourceManager};
use crate::sampler::SamplerDesc;
use crate::sched::{AcquiredImages, TaskProcessor};
use crate::staging::{ReadbackStatus, StagingConfig, StagingManager};
use crate::submit::{BatchToken, FrameStats, SubmissionBatcher};
use crate::sync::QueueKind;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Tuning knobs of one frame graph instance.
#[derive(Clone, Debug)]
pub struct FrameGraphConfig {
    pub frames_in_flight: usize,
    pub staging: StagingConfig,
    /// Device heap size for the slab allocator; 0 uses the driver's
    /// preference.
    pub heap_size: u64,
    /// Bounded growth: heaps allocated before `OutOfMemory` is reported.
    pub max_heaps: usize,
    pub descriptor_sets_per_frame: u32,
    /// Deadline for fence waits in `flush`/`wait_idle`.
    pub fence_wait_ns: u64,
    /// Concurrently recording command buffers before `QueueExhausted`.
    pub max_recording: u32,
}

impl Default for FrameGraphConfig {
    fn default() -> Self {
        FrameGraphConfig {
            frames_in_flight: 2,
            staging: StagingConfig::default(),
            heap_size: 0,
            max_heaps: 16,
            descriptor_sets_per_frame: 1024,
            fence_wait_ns: 10_000_000_000,
            max_recording: 64,
        }
    }
}

/// Accepted by operations that take any pipeline kind.
pub trait PipelineHandle: Copy {
    fn raw_id(self) -> RawId;
}

impl PipelineHandle for GPipelineId {
    fn raw_id(self) -> RawId {
        self.raw()
    }
}

impl PipelineHandle for CPipelineId {
    fn raw_id(self) -> RawId {
        self.raw()
    }
}

impl PipelineHandle for MPipelineId {
    fn raw_id(self) -> RawId {
        self.raw()
    }
}

impl PipelineHandle for RtPipelineId {
    fn raw_id(self) -> RawId {
        self.raw()
    }
}

pub struct FrameGraph {
    driver: Arc<dyn Driver>,
    manager: Arc<ResourceManager>,
    cache: PipelineCache,
    staging: StagingManager,
    batcher: Mutex<SubmissionBatcher>,
    debug_callback: Mutex<Option<ShaderDebugCallback>>,
    last_dump: Mutex<Option<String>>,
    features: FeatureFlags,
    device_lost: AtomicBool,
    recording: Arc<AtomicU32>,
    max_recording: u32,
}

impl FrameGraph {
    pub fn new(
        driver: Arc<dyn Driver>,
        compiler: Arc<dyn ShaderCompiler>,
        config: FrameGraphConfig,
    ) -> Result<FrameGraph> {
        let caps = driver.caps();
        let heap_size = if config.heap_size != 0 {
            config.heap_size
        } else if caps.heap_size != 0 {
            caps.heap_size
        } else {
            64 * 1024 * 1024
        };
        let manager = Arc::new(ResourceManager::new(
            driver.clone(),
            heap_size,
            config.max_heaps,
        ));
        let cache = PipelineCache::new(
            driver.clone(),
            compiler,
            config.frames_in_flight,
            config.descriptor_sets_per_frame,
        )?;
        let staging = StagingManager::new(driver.clone(), config.staging, config.frames_in_flight);
        let batcher = SubmissionBatcher::new(
            driver.clone(),
            config.frames_in_flight,
            config.fence_wait_ns,
        );
        Ok(FrameGraph {
            features: caps.features,
            driver,
            manager,
            cache,
            staging,
            batcher: Mutex::new(batcher),
            debug_callback: Mutex::new(None),
            last_dump: Mutex::new(None),
            device_lost: AtomicBool::new(false),
            recording: Arc::new(AtomicU32::new(0)),
            max_recording: config.max_recording,
        })
    }

    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_device_lost() {
            return Err(Error::DeviceLost);
        }
        Ok(())
    }

    fn note_terminal(&self, error: &Error) {
        if error.is_terminal() {
            self.enter_device_lost();
        }
    }

    fn enter_device_lost(&self) {
        if !self.device_lost.swap(true, Ordering::AcqRel) {
            log::error!("device lost: frame graph is now terminal");
            let mut batcher = self.batcher.lock();
            batcher.abort_all(
                &self.manager,
                &self.cache,
                &self.staging,
                ReadbackStatus::DeviceLost,
            );
        }
    }

    // -----------------------------------------------------------------------
    // Resource CRUD

    pub fn create_image(&self, desc: &ImageDesc, debug_name: Option<&str>) -> Result<ImageId> {
        self.check_usable()?;
        self.manager.create_image(desc, debug_name)
    }

    /// Transient image valid for the current frame only; its memory aliases
    /// other transients of the frame and the reference is dropped when the
    /// frame retires.
    pub fn create_transient_image(
        &self,
        desc: &ImageDesc,
        debug_name: Option<&str>,
    ) -> Result<ImageId> {
        self.check_usable()?;
        let mut batcher = self.batcher.lock();
        let slot = batcher.current_slot() as u32;
        let image = self.manager.create_transient_image(desc, slot, debug_name)?;
        batcher.register_transient(image.raw());
        Ok(image)
    }

    pub fn create_buffer(&self, desc: &BufferDesc, debug_name: Option<&str>) -> Result<BufferId> {
        self.check_usable()?;
        self.manager.create_buffer(desc, debug_name)
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId> {
        self.check_usable()?;
        self.manager.create_sampler(desc)
    }

    pub fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        debug_name: Option<&str>,
    ) -> Result<GPipelineId> {
        self.check_usable()?;
        let kind = if desc.has_mesh_stages() {
            return Err(Error::ValidationFailed(
                "mesh stages belong in a mesh pipeline descriptor".to_owned(),
            ));
        } else {
            PipelineKind::Graphics
        };
        let raw = self.cache.create_pipeline(
            &self.manager,
            kind,
            &desc.shaders,
            Some(GraphicsState {
                input_assembly: desc.input_assembly,
                rasterization: desc.rasterization,
                depth_stencil: desc.depth_stencil,
                color_blend: desc.color_blend.clone(),
                vertex_input: desc.vertex_input.clone(),
            }),
            self.features,
            debug_name,
        )?;
        Ok(GPipelineId::from_raw(raw))
    }

    pub fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        debug_name: Option<&str>,
    ) -> Result<CPipelineId> {
        self.check_usable()?;
        let shader = desc.shader.clone().ok_or_else(|| {
            Error::ValidationFailed("compute pipeline has no shader".to_owned())
        })?;
        let raw = self.cache.create_pipeline(
            &self.manager,
            PipelineKind::Compute,
            std::slice::from_ref(&shader),
            None,
            self.features,
            debug_name,
        )?;
        Ok(CPipelineId::from_raw(raw))
    }

    pub fn create_mesh_pipeline(
        &self,
        desc: &MeshPipelineDesc,
        debug_name: Option<&str>,
    ) -> Result<MPipelineId> {
        self.check_usable()?;
        if !self.features.contains(FeatureFlags::MESH_SHADER) {
            return Err(Error::ValidationFailed(
                "mesh shaders are not supported by this device".to_owned(),
            ));
        }
        let raw = self.cache.create_pipeline(
            &self.manager,
            PipelineKind::Mesh,
            &desc.shaders,
            Some(GraphicsState {
                rasterization: desc.rasterization,
                depth_stencil: desc.depth_stencil,
                color_blend: desc.color_blend.clone(),
                ..Default::default()
            }),
            self.features,
            debug_name,
        )?;
        Ok(MPipelineId::from_raw(raw))
    }

    pub fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc,
        debug_name: Option<&str>,
    ) -> Result<RtPipelineId> {
        self.check_usable()?;
        if !self.features.contains(FeatureFlags::RAY_TRACING) {
            return Err(Error::ValidationFailed(
                "ray tracing is not supported by this device".to_owned(),
            ));
        }
        let raw = self.cache.create_pipeline(
            &self.manager,
            PipelineKind::RayTracing,
            &desc.shaders,
            None,
            self.features,
            debug_name,
        )?;
        Ok(RtPipelineId::from_raw(raw))
    }

    pub fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        debug_name: Option<&str>,
    ) -> Result<SwapchainId> {
        self.check_usable()?;
        self.manager.create_swapchain(desc, debug_name)
    }

    pub fn swapchain_images(&self, swapchain: SwapchainId) -> Result<Vec<ImageId>> {
        Ok(self
            .manager
            .swapchains
            .read()
            .get(swapchain.raw())?
            .images
            .clone())
    }

    /// Creation descriptor of an image. Stale handles report
    /// [`Error::InvalidHandle`] without touching anything.
    pub fn image_desc(&self, image: ImageId) -> Result<ImageDesc> {
        self.manager.image_desc(image)
    }

    pub fn buffer_desc(&self, buffer: BufferId) -> Result<BufferDesc> {
        self.manager.buffer_desc(buffer)
    }

    pub fn sampler_desc(&self, sampler: SamplerId) -> Result<SamplerDesc> {
        self.manager.sampler_desc(sampler)
    }

    pub fn swapchain_desc(&self, swapchain: SwapchainId) -> Result<SwapchainDesc> {
        self.manager.swapchain_desc(swapchain)
    }

    /// Clones a strong reference to the resource.
    pub fn acquire_resource<T: ResourceTag>(&self, id: Id<T>) -> Result<Id<T>> {
        self.manager.add_ref(id.raw()).map(Id::from_raw)
    }

    /// Drops a strong reference, returning the remaining count. The resource
    /// is destroyed (fence-gated) when it reaches zero. Releasing a stale or
    /// fabricated handle is a warned no-op returning 0.
    pub fn release_resource<T: ResourceTag>(&self, id: Id<T>) -> u32 {
        self.manager.release(id.raw())
    }

    /// Populates an empty bindings table for one descriptor set of a
    /// pipeline. Returns false (with a logged diagnostic) on failure.
    pub fn init_pipeline_resources<P: PipelineHandle>(
        &self,
        resources: &mut PipelineResources,
        pipeline: P,
        set: impl Into<DescriptorSetId>,
    ) -> bool {
        match self
            .manager
            .init_pipeline_resources(resources, pipeline.raw_id(), &set.into())
        {
            Ok(()) => true,
            Err(e) => {
                log::warn!("init_pipeline_resources failed: {}", e);
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Frame loop

    /// Opens a command buffer for recording. `wait_for` batches execute
    /// before anything recorded here.
    pub fn begin(
        &self,
        desc: CommandBufferDesc,
        wait_for: &[BatchToken],
    ) -> Result<CommandBuffer> {
        self.check_usable()?;
        let active = self.recording.fetch_add(1, Ordering::AcqRel);
        if active >= self.max_recording {
            self.recording.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::QueueExhausted);
        }
        let mut desc = desc;
        desc.queue = self.map_queue(desc.queue);
        Ok(CommandBuffer::new(
            desc,
            self.manager.clone(),
            wait_for.to_vec(),
            Some(RecordingGuard(self.recording.clone())),
        ))
    }

    /// Queues not present on the device fall back to the graphics queue.
    fn map_queue(&self, queue: QueueKind) -> QueueKind {
        match queue {
            QueueKind::AsyncCompute if !self.features.contains(FeatureFlags::ASYNC_COMPUTE) => {
                QueueKind::Graphics
            }
            QueueKind::Transfer if !self.features.contains(FeatureFlags::TRANSFER_QUEUE) => {
                QueueKind::Graphics
            }
            queue => queue,
        }
    }

    /// Hands a recorded buffer to the task processor and submission batcher.
    /// Returns false on failure; other buffers of the frame are unaffected.
    pub fn execute(&self, cmd: CommandBuffer) -> bool {
        match self.execute_batch(cmd) {
            Ok(_) => true,
            Err(e) => {
                log::error!("execute failed: {}", e);
                false
            }
        }
    }

    /// Like [`execute`] but returns the batch token for `wait_for` edges.
    ///
    /// [`execute`]: FrameGraph::execute
    pub fn execute_batch(&self, mut cmd: CommandBuffer) -> Result<BatchToken> {
        self.check_usable()?;
        cmd.finish_recording();

        // Solve and merge under the submission lock, so the access-tracking
        // snapshots seen by the solver always match the submission order.
        let mut batcher_guard = self.batcher.lock();
        let batcher = &mut *batcher_guard;

        let mut acquired = AcquiredImages::default();
        let mut acquire_semaphores = Vec::new();
        for task in &cmd.tasks {
            if let TaskKind::PresentImage { swapchain, .. } = &task.kind {
                if !acquired.contains_key(swapchain) {
                    let device = self.manager.swapchains.read().get(*swapchain)?.device;
                    let semaphore = self.driver.create_semaphore()?;
                    let index = match self.driver.acquire_image(device, semaphore) {
                        Ok(index) => index,
                        Err(e) => {
                            self.driver.destroy_semaphore(semaphore);
                            self.note_terminal(&e);
                            return Err(e);
                        }
                    };
                    acquired.insert(*swapchain, index);
                    acquire_semaphores.push(semaphore);
                }
            }
        }

        let processor = TaskProcessor::new(
            &self.manager,
            &self.cache,
            &self.staging,
            batcher.current_slot(),
            batcher.next_task_serial_base(),
        );
        let wait_for = cmd.wait_for.clone();
        let compiled = processor.process(cmd, &acquired)?;
        if let Some(dump) = &compiled.dump {
            log::debug!("{}", dump);
            *self.last_dump.lock() = Some(dump.clone());
        }
        match batcher.submit(&self.manager, compiled, &wait_for, acquire_semaphores) {
            Ok(token) => Ok(token),
            Err(e) => {
                self.note_terminal(&e);
                Err(e)
            }
        }
    }

    /// Closes the current submission window, polls completions and fires due
    /// retirements.
    pub fn flush(&self) -> bool {
        if self.is_device_lost() {
            return false;
        }
        let callback = self.debug_callback.lock();
        let result =
            self.batcher
                .lock()
                .flush(&self.manager, &self.cache, &self.staging, &*callback);
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("flush failed: {}", e);
                self.note_terminal(&e);
                false
            }
        }
    }

    /// Blocks until every pending fence signals and drains all callbacks.
    pub fn wait_idle(&self) -> bool {
        if self.is_device_lost() {
            return false;
        }
        let callback = self.debug_callback.lock();
        let result =
            self.batcher
                .lock()
                .wait_idle(&self.manager, &self.cache, &self.staging, &*callback);
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("wait_idle failed: {}", e);
                self.note_terminal(&e);
                false
            }
        }
    }

    /// Installs the receiver for captured shader-trace buffers.
    pub fn set_shader_debug_callback(&self, callback: Option<ShaderDebugCallback>) {
        *self.debug_callback.lock() = callback;
    }

    /// Statistics of the last closed submission window.
    pub fn last_frame_stats(&self) -> FrameStats {
        self.batcher.lock().last_stats()
    }

    /// Text dump of the most recent graph executed with
    /// `DebugFlags::DUMP_GRAPH`.
    pub fn last_graph_dump(&self) -> Option<String> {
        self.last_dump.lock().clone()
    }
}

impl Drop for FrameGraph {
    fn drop(&mut self) {
        // Cancellation is coarse: drain what we can, abort the rest.
        if !self.is_device_lost() {
            let callback = self.debug_callback.lock();
            let _ = self
                .batcher
                .lock()
                .wait_idle(&self.manager, &self.cache, &self.staging, &*callback);
        }
        self.batcher.lock().abort_all(
            &self.manager,
            &self.cache,
            &self.staging,
            ReadbackStatus::Aborted,
        );
        self.staging.destroy();
    }
}

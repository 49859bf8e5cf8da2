//! Device-state bookkeeping and the `Driver` implementation.

use crate::execute::Interpreter;
use crate::shaders::{bytecode_key, ShaderRegistry, SoftShader, SoftShaderKind};
use chroma_render::buffer::BufferDesc;
use chroma_render::driver::*;
use chroma_render::error::{Error, Result};
use chroma_render::image::ImageDesc;
use chroma_render::memory::MemoryType;
use chroma_render::pipeline::PrimitiveTopology;
use chroma_render::sampler::SamplerDesc;
use chroma_render::sync::QueueKind;
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct SoftImage {
    pub desc: ImageDesc,
    /// Tightly packed level 0: `row_pitch = width * texel_size`.
    pub bytes: Vec<u8>,
}

impl SoftImage {
    pub fn new(desc: &ImageDesc) -> SoftImage {
        let size = desc.byte_size() as usize;
        SoftImage {
            desc: desc.clone(),
            bytes: vec![0; size],
        }
    }

    pub fn row_pitch(&self) -> usize {
        self.desc.dimensions.width() as usize * self.desc.format.texel_size() as usize
    }

    pub fn texel_offset(&self, x: u32, y: u32, z: u32) -> usize {
        let slice_pitch = self.row_pitch() * self.desc.dimensions.height() as usize;
        z as usize * slice_pitch
            + y as usize * self.row_pitch()
            + x as usize * self.desc.format.texel_size() as usize
    }

    pub fn in_bounds(&self, x: i32, y: i32, z: i32) -> bool {
        x >= 0
            && y >= 0
            && z >= 0
            && (x as u32) < self.desc.dimensions.width()
            && (y as u32) < self.desc.dimensions.height()
            && (z as u32) < self.desc.dimensions.depth().max(self.desc.dimensions.array_layers())
    }
}

pub(crate) struct SoftBuffer {
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub(crate) enum SoftPipeline {
    Compute {
        shader: SoftShader,
    },
    Graphics {
        vertex: SoftShader,
        fragment: Option<SoftShader>,
        topology: PrimitiveTopology,
    },
}

pub(crate) struct SoftDescriptorSet {
    pub writes: Vec<DescriptorWrite>,
}

pub(crate) struct SoftSwapchain {
    pub images: Vec<u64>,
    pub next: u32,
}

#[derive(Default)]
pub(crate) struct DeviceState {
    next_id: u64,
    pub images: FxHashMap<u64, SoftImage>,
    pub buffers: FxHashMap<u64, SoftBuffer>,
    pub samplers: FxHashMap<u64, SamplerDesc>,
    pub pipelines: FxHashMap<u64, SoftPipeline>,
    pub render_passes: FxHashMap<u64, RenderPassDesc>,
    pub framebuffers: FxHashMap<u64, (u64, Vec<u64>, u32, u32)>,
    pub layouts: FxHashMap<u64, Vec<LayoutBindingDesc>>,
    pub pools: FxHashMap<u64, Vec<u64>>,
    pub sets: FxHashMap<u64, SoftDescriptorSet>,
    pub fences: FxHashMap<u64, bool>,
    pub semaphores: FxHashSet<u64>,
    pub swapchains: FxHashMap<u64, SoftSwapchain>,
    pub command_lists: FxHashMap<u64, Vec<DriverCmd>>,
    pub heaps: FxHashSet<u64>,
}

impl DeviceState {
    pub fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// The software driver: every resource is a byte array, submissions execute
/// synchronously on the calling thread, fences signal at submit.
pub struct SoftDriver {
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) registry: Arc<ShaderRegistry>,
    caps: DriverCaps,
    log_commands: bool,
}

impl SoftDriver {
    pub fn new(registry: Arc<ShaderRegistry>) -> Arc<SoftDriver> {
        Self::with_config(registry, &config::Config::new())
    }

    /// Reads optional overrides the way a windowed backend reads its GL
    /// options: `soft.log_commands`, `soft.mesh_shader`.
    pub fn with_config(registry: Arc<ShaderRegistry>, cfg: &config::Config) -> Arc<SoftDriver> {
        let mut features = FeatureFlags::SHADER_DEBUG_TRACE
            | FeatureFlags::ASYNC_COMPUTE
            | FeatureFlags::TRANSFER_QUEUE;
        if cfg.get_bool("soft.mesh_shader").unwrap_or(false) {
            features |= FeatureFlags::MESH_SHADER;
        }
        let log_commands = cfg.get_bool("soft.log_commands").unwrap_or(false);
        Arc::new(SoftDriver {
            state: Mutex::new(DeviceState::default()),
            registry,
            caps: DriverCaps {
                features,
                staging_alignment: 4,
                heap_size: 4 * 1024 * 1024,
            },
            log_commands,
        })
    }

    fn shader_for(&self, bytecode: &[u8]) -> Result<SoftShader> {
        let key = bytecode_key(bytecode)
            .ok_or_else(|| Error::CompileFailed("malformed bytecode blob".to_owned()))?;
        self.registry
            .lookup_key(key)
            .ok_or_else(|| Error::CompileFailed(format!("unknown shader key {}", key)))
    }
}

impl Driver for SoftDriver {
    fn caps(&self) -> DriverCaps {
        self.caps.clone()
    }

    fn allocate_heap(&self, _size: u64, _memory_type: MemoryType) -> Result<DeviceMemory> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.heaps.insert(id);
        Ok(DeviceMemory(id))
    }

    fn free_heap(&self, heap: DeviceMemory) {
        self.state.lock().heaps.remove(&heap.0);
    }

    fn create_image(
        &self,
        desc: &ImageDesc,
        _memory: &MemoryBind,
        _debug_name: Option<&str>,
    ) -> Result<DeviceImage> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.images.insert(id, SoftImage::new(desc));
        Ok(DeviceImage(id))
    }

    fn destroy_image(&self, image: DeviceImage) {
        self.state.lock().images.remove(&image.0);
    }

    fn create_buffer(
        &self,
        desc: &BufferDesc,
        _memory: &MemoryBind,
        _debug_name: Option<&str>,
    ) -> Result<DeviceBuffer> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.buffers.insert(
            id,
            SoftBuffer {
                bytes: vec![0; desc.size as usize],
            },
        );
        Ok(DeviceBuffer(id))
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        self.state.lock().buffers.remove(&buffer.0);
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<DeviceSampler> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.samplers.insert(id, *desc);
        Ok(DeviceSampler(id))
    }

    fn destroy_sampler(&self, sampler: DeviceSampler) {
        self.state.lock().samplers.remove(&sampler.0);
    }

    fn write_buffer(&self, buffer: DeviceBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Error::ValidationFailed("write to unknown buffer".to_owned()))?;
        let offset = offset as usize;
        if offset + data.len() > buffer.bytes.len() {
            return Err(Error::ValidationFailed("buffer write out of range".to_owned()));
        }
        buffer.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: DeviceBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let buffer = state
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| Error::ValidationFailed("read from unknown buffer".to_owned()))?;
        let offset = offset as usize;
        if offset + out.len() > buffer.bytes.len() {
            return Err(Error::ValidationFailed("buffer read out of range".to_owned()));
        }
        out.copy_from_slice(&buffer.bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBindingDesc],
    ) -> Result<DeviceDescriptorSetLayout> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.layouts.insert(id, bindings.to_vec());
        Ok(DeviceDescriptorSetLayout(id))
    }

    fn destroy_descriptor_set_layout(&self, layout: DeviceDescriptorSetLayout) {
        self.state.lock().layouts.remove(&layout.0);
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<DeviceRenderPass> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.render_passes.insert(id, desc.clone());
        Ok(DeviceRenderPass(id))
    }

    fn destroy_render_pass(&self, render_pass: DeviceRenderPass) {
        self.state.lock().render_passes.remove(&render_pass.0);
    }

    fn create_framebuffer(
        &self,
        render_pass: DeviceRenderPass,
        attachments: &[DeviceImage],
        width: u32,
        height: u32,
    ) -> Result<DeviceFramebuffer> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.framebuffers.insert(
            id,
            (
                render_pass.0,
                attachments.iter().map(|a| a.0).collect(),
                width,
                height,
            ),
        );
        Ok(DeviceFramebuffer(id))
    }

    fn destroy_framebuffer(&self, framebuffer: DeviceFramebuffer) {
        self.state.lock().framebuffers.remove(&framebuffer.0);
    }

    fn create_graphics_pipeline(
        &self,
        info: &GraphicsPipelineCreateInfo<'_>,
    ) -> Result<DevicePipeline> {
        let mut vertex = None;
        let mut fragment = None;
        for stage in info.stages {
            let shader = self.shader_for(&stage.bytecode)?;
            match shader.kind {
                SoftShaderKind::Vertex(_) => vertex = Some(shader),
                SoftShaderKind::Fragment(_) => fragment = Some(shader),
                SoftShaderKind::Compute(_) => {
                    return Err(Error::CompileFailed(
                        "compute shader in a graphics pipeline".to_owned(),
                    ));
                }
            }
        }
        let vertex = vertex.ok_or_else(|| {
            Error::CompileFailed("graphics pipeline without a vertex shader".to_owned())
        })?;
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.pipelines.insert(
            id,
            SoftPipeline::Graphics {
                vertex,
                fragment,
                topology: info.input_assembly.topology,
            },
        );
        Ok(DevicePipeline(id))
    }

    fn create_compute_pipeline(
        &self,
        info: &ComputePipelineCreateInfo<'_>,
    ) -> Result<DevicePipeline> {
        let shader = self.shader_for(&info.stage.bytecode)?;
        if !matches!(shader.kind, SoftShaderKind::Compute(_)) {
            return Err(Error::CompileFailed(
                "non-compute shader in a compute pipeline".to_owned(),
            ));
        }
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.pipelines.insert(id, SoftPipeline::Compute { shader });
        Ok(DevicePipeline(id))
    }

    fn destroy_pipeline(&self, pipeline: DevicePipeline) {
        self.state.lock().pipelines.remove(&pipeline.0);
    }

    fn create_descriptor_pool(&self, _max_sets: u32) -> Result<DeviceDescriptorPool> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.pools.insert(id, Vec::new());
        Ok(DeviceDescriptorPool(id))
    }

    fn destroy_descriptor_pool(&self, pool: DeviceDescriptorPool) {
        let mut state = self.state.lock();
        if let Some(sets) = state.pools.remove(&pool.0) {
            for set in sets {
                state.sets.remove(&set);
            }
        }
    }

    fn reset_descriptor_pool(&self, pool: DeviceDescriptorPool) -> Result<()> {
        let mut state = self.state.lock();
        let sets = state
            .pools
            .get_mut(&pool.0)
            .map(|sets| std::mem::replace(sets, Vec::new()))
            .ok_or_else(|| Error::ValidationFailed("reset of unknown pool".to_owned()))?;
        for set in sets {
            state.sets.remove(&set);
        }
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: DeviceDescriptorPool,
        _layout: DeviceDescriptorSetLayout,
    ) -> Result<DeviceDescriptorSet> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state
            .pools
            .get_mut(&pool.0)
            .ok_or_else(|| Error::ValidationFailed("allocation from unknown pool".to_owned()))?
            .push(id);
        state
            .sets
            .insert(id, SoftDescriptorSet { writes: Vec::new() });
        Ok(DeviceDescriptorSet(id))
    }

    fn update_descriptor_set(
        &self,
        set: DeviceDescriptorSet,
        writes: &[DescriptorWrite],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let set = state
            .sets
            .get_mut(&set.0)
            .ok_or_else(|| Error::ValidationFailed("update of unknown set".to_owned()))?;
        set.writes = writes.to_vec();
        Ok(())
    }

    fn create_semaphore(&self) -> Result<DeviceSemaphore> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.semaphores.insert(id);
        Ok(DeviceSemaphore(id))
    }

    fn destroy_semaphore(&self, semaphore: DeviceSemaphore) {
        self.state.lock().semaphores.remove(&semaphore.0);
    }

    fn create_fence(&self) -> Result<DeviceFence> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.fences.insert(id, false);
        Ok(DeviceFence(id))
    }

    fn destroy_fence(&self, fence: DeviceFence) {
        self.state.lock().fences.remove(&fence.0);
    }

    fn fence_signaled(&self, fence: DeviceFence) -> Result<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| Error::ValidationFailed("query of unknown fence".to_owned()))
    }

    fn wait_fences(&self, fences: &[DeviceFence], _timeout_ns: u64) -> Result<bool> {
        // Execution is synchronous: every submitted fence is already
        // signaled.
        let state = self.state.lock();
        Ok(fences
            .iter()
            .all(|f| state.fences.get(&f.0).copied().unwrap_or(true)))
    }

    fn record(&self, _queue: QueueKind, cmds: &[DriverCmd]) -> Result<DeviceCommandList> {
        let mut state = self.state.lock();
        let id = state.fresh_id();
        state.command_lists.insert(id, cmds.to_vec());
        Ok(DeviceCommandList(id))
    }

    fn destroy_command_list(&self, list: DeviceCommandList) {
        self.state.lock().command_lists.remove(&list.0);
    }

    fn submit(&self, queue: QueueKind, submit: SubmitInfo) -> Result<()> {
        let mut state = self.state.lock();
        for list in &submit.command_lists {
            let cmds = state
                .command_lists
                .get(&list.0)
                .cloned()
                .ok_or_else(|| Error::ValidationFailed("submit of unknown list".to_owned()))?;
            if self.log_commands {
                for cmd in &cmds {
                    log::trace!("[{:?}] {:?}", queue, cmd);
                }
            }
            Interpreter::new(&mut state).run(&cmds)?;
        }
        if let Some(fence) = submit.fence {
            state.fences.insert(fence.0, true);
        }
        Ok(())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
    ) -> Result<(DeviceSwapchain, Vec<DeviceImage>)> {
        let image_desc = ImageDesc::new()
            .dimensions((desc.width, desc.height))
            .format(desc.format)
            .usage(
                chroma_render::image::ImageUsage::COLOR_ATTACHMENT
                    | chroma_render::image::ImageUsage::TRANSFER_DST,
            );
        let mut state = self.state.lock();
        let mut images = Vec::with_capacity(desc.image_count as usize);
        for _ in 0..desc.image_count.max(1) {
            let id = state.fresh_id();
            state.images.insert(id, SoftImage::new(&image_desc));
            images.push(DeviceImage(id));
        }
        let id = state.fresh_id();
        state.swapchains.insert(
            id,
            SoftSwapchain {
                images: images.iter().map(|i| i.0).collect(),
                next: 0,
            },
        );
        Ok((DeviceSwapchain(id), images))
    }

    fn destroy_swapchain(&self, swapchain: DeviceSwapchain) {
        let mut state = self.state.lock();
        if let Some(sc) = state.swapchains.remove(&swapchain.0) {
            for image in sc.images {
                state.images.remove(&image);
            }
        }
    }

    fn acquire_image(
        &self,
        swapchain: DeviceSwapchain,
        _semaphore: DeviceSemaphore,
    ) -> Result<u32> {
        let mut state = self.state.lock();
        let sc = state
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| Error::ValidationFailed("acquire on unknown swapchain".to_owned()))?;
        let index = sc.next;
        sc.next = (sc.next + 1) % sc.images.len() as u32;
        Ok(index)
    }

    fn present(
        &self,
        _queue: QueueKind,
        swapchain: DeviceSwapchain,
        image_index: u32,
        _wait: DeviceSemaphore,
    ) -> Result<()> {
        let state = self.state.lock();
        let sc = state
            .swapchains
            .get(&swapchain.0)
            .ok_or_else(|| Error::ValidationFailed("present on unknown swapchain".to_owned()))?;
        if image_index as usize >= sc.images.len() {
            return Err(Error::ValidationFailed("present of unknown image".to_owned()));
        }
        log::debug!("present image {} of swapchain {:?}", image_index, swapchain);
        Ok(())
    }
}

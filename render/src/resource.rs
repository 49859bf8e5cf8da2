//! The resource manager.
//!
//! Owns one generational id table per resource kind, the content-addressable
//! interning index for sharable resources, strong reference counts, and the
//! slab sub-allocator for device memory. Destruction is deferred: dropping
//! the last reference enqueues the driver objects onto the retirement ring;
//! they are destroyed only when the fence of the last referencing submission
//! has signaled.
//!
//! Only this module mutates resource records after creation. The task
//! processor computes on shadow copies of the access-tracking state and
//! reconciles them here under the submission lock.

use crate::buffer::BufferDesc;
use crate::driver::{
    DeviceBuffer, DeviceDescriptorSetLayout, DeviceFramebuffer, DeviceImage, DevicePipeline,
    DevicePipelineLayout, DeviceRenderPass, DeviceSampler, DeviceSwapchain, Driver,
    LayoutBindingDesc, MemoryBind, RenderPassDesc, SwapchainDesc,
};
use crate::error::{Error, Result};
use crate::handle::{
    BufferId, FramebufferId, IdTable, ImageId, RawId, RenderPassId, ResourceKind, SamplerId,
    SwapchainId,
};
use crate::image::ImageDesc;
use crate::memory::{MemoryBlock, MemoryType, SlabAllocator};
use crate::pipeline::resources::UniformSlot;
use crate::pipeline::{PushConstantRange, ShaderReflection};
use crate::sampler::SamplerDesc;
use crate::sync::{AccessFlags, ImageLayout, QueueKind, StageFlags};
use crate::util::content_hash;
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Most recent *submitted* access of a resource.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AccessState {
    pub stage: StageFlags,
    pub access: AccessFlags,
    pub layout: ImageLayout,
    pub queue: QueueKind,
    /// Global serial of the last writing task, for diagnostics.
    pub writer: Option<u64>,
}

impl Default for AccessState {
    fn default() -> Self {
        AccessState {
            stage: StageFlags::TOP_OF_PIPE,
            access: AccessFlags::empty(),
            layout: ImageLayout::Undefined,
            queue: QueueKind::Graphics,
            writer: None,
        }
    }
}

/// Driver-side leftovers of a destroyed resource, deleted at frame
/// retirement.
#[derive(Debug)]
pub enum RetiredObject {
    Image(DeviceImage, Option<MemoryBlock>),
    Buffer(DeviceBuffer, Option<MemoryBlock>),
    Sampler(DeviceSampler),
    Pipeline(DevicePipeline),
    RenderPass(DeviceRenderPass),
    Framebuffer(DeviceFramebuffer),
    DescriptorSetLayout(DeviceDescriptorSetLayout),
    Swapchain(DeviceSwapchain),
}

pub struct ImageRecord {
    pub desc: ImageDesc,
    pub device: DeviceImage,
    pub memory: Option<MemoryBlock>,
    /// Transients sharing memory belong to one alias group; the solver
    /// inserts aliasing barriers at handoff.
    pub alias_group: Option<u32>,
    pub swapchain: Option<(SwapchainId, u32)>,
    pub debug_name: Option<String>,
    pub state: AccessState,
    pub(crate) refs: AtomicU32,
}

pub struct BufferRecord {
    pub desc: BufferDesc,
    pub device: DeviceBuffer,
    pub memory: Option<MemoryBlock>,
    pub debug_name: Option<String>,
    pub state: AccessState,
    pub(crate) refs: AtomicU32,
}

pub struct SamplerRecord {
    pub desc: SamplerDesc,
    pub device: DeviceSampler,
    pub hash: u64,
    pub(crate) refs: AtomicU32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PipelineKind {
    Graphics,
    Compute,
    Mesh,
    RayTracing,
}

impl PipelineKind {
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            PipelineKind::Graphics => ResourceKind::GraphicsPipeline,
            PipelineKind::Compute => ResourceKind::ComputePipeline,
            PipelineKind::Mesh => ResourceKind::MeshPipeline,
            PipelineKind::RayTracing => ResourceKind::RayTracingPipeline,
        }
    }
}

/// One reflected descriptor set of a pipeline, with its interned layout.
#[derive(Clone, Debug)]
pub struct PipelineSetLayout {
    pub index: u32,
    pub name: crate::names::DescriptorSetId,
    pub layout: RawId,
    pub uniforms: Vec<UniformSlot>,
}

pub struct PipelineRecord {
    pub kind: PipelineKind,
    pub stages: Vec<crate::driver::CompiledShader>,
    /// Client debug names per stage, parallel to `stages`.
    pub stage_names: Vec<Option<String>>,
    pub sets: Vec<PipelineSetLayout>,
    pub push_constants: Vec<PushConstantRange>,
    pub reflection: ShaderReflection,
    pub layout: DevicePipelineLayout,
    /// Fixed-function state; `None` for compute and ray-tracing pipelines.
    pub graphics: Option<crate::pipeline::GraphicsState>,
    pub hash: u64,
    pub debug_name: Option<String>,
    /// Device pipelines per render-pass compatibility key, filled by the
    /// pipeline cache on first use.
    pub variants: Mutex<FxHashMap<u64, DevicePipeline>>,
    pub(crate) refs: AtomicU32,
}

pub struct DescriptorSetLayoutRecord {
    pub bindings: Vec<LayoutBindingDesc>,
    pub uniforms: Vec<UniformSlot>,
    pub device: DeviceDescriptorSetLayout,
    pub hash: u64,
    pub(crate) refs: AtomicU32,
}

pub struct RenderPassRecord {
    pub desc: RenderPassDesc,
    pub device: DeviceRenderPass,
    pub hash: u64,
    pub(crate) refs: AtomicU32,
}

pub struct FramebufferRecord {
    pub render_pass: RenderPassId,
    pub attachments: Vec<ImageId>,
    pub width: u32,
    pub height: u32,
    pub device: DeviceFramebuffer,
    pub hash: u64,
    pub(crate) refs: AtomicU32,
}

pub struct SwapchainRecord {
    pub desc: SwapchainDesc,
    pub device: DeviceSwapchain,
    pub images: Vec<ImageId>,
    pub(crate) refs: AtomicU32,
}

macro_rules! impl_refs {
    ($($ty:ty),*) => {
        $(impl $ty {
            fn refs(&self) -> &AtomicU32 { &self.refs }
        })*
    };
}

impl_refs!(
    ImageRecord,
    BufferRecord,
    SamplerRecord,
    PipelineRecord,
    DescriptorSetLayoutRecord,
    RenderPassRecord,
    FramebufferRecord,
    SwapchainRecord
);

pub(crate) fn new_refs() -> AtomicU32 {
    AtomicU32::new(1)
}

/// Capacity per table; generous but bounded, as the id packing requires.
const TABLE_CAPACITY: usize = 1 << 20;

pub struct ResourceManager {
    driver: Arc<dyn Driver>,
    pub(crate) images: RwLock<IdTable<ImageRecord>>,
    pub(crate) buffers: RwLock<IdTable<BufferRecord>>,
    pub(crate) samplers: RwLock<IdTable<SamplerRecord>>,
    pub(crate) g_pipelines: RwLock<IdTable<PipelineRecord>>,
    pub(crate) c_pipelines: RwLock<IdTable<PipelineRecord>>,
    pub(crate) m_pipelines: RwLock<IdTable<PipelineRecord>>,
    pub(crate) rt_pipelines: RwLock<IdTable<PipelineRecord>>,
    pub(crate) ds_layouts: RwLock<IdTable<DescriptorSetLayoutRecord>>,
    pub(crate) render_passes: RwLock<IdTable<RenderPassRecord>>,
    pub(crate) framebuffers: RwLock<IdTable<FramebufferRecord>>,
    pub(crate) swapchains: RwLock<IdTable<SwapchainRecord>>,
    /// Content-addressable index of the sharable kinds.
    intern: Mutex<FxHashMap<(ResourceKind, u64), SmallVec<[RawId; 2]>>>,
    slab: Mutex<SlabAllocator>,
    /// Bounded device-heap growth before reporting `OutOfMemory`.
    max_heaps: usize,
    /// Destroyed records pending fence-gated deletion; drained into the
    /// current frame's retirement ring by the submission batcher.
    pending_destroy: Mutex<Vec<RetiredObject>>,
}

impl ResourceManager {
    pub fn new(driver: Arc<dyn Driver>, heap_size: u64, max_heaps: usize) -> ResourceManager {
        ResourceManager {
            driver,
            images: RwLock::new(IdTable::new(ResourceKind::Image, TABLE_CAPACITY)),
            buffers: RwLock::new(IdTable::new(ResourceKind::Buffer, TABLE_CAPACITY)),
            samplers: RwLock::new(IdTable::new(ResourceKind::Sampler, TABLE_CAPACITY)),
            g_pipelines: RwLock::new(IdTable::new(
                ResourceKind::GraphicsPipeline,
                TABLE_CAPACITY,
            )),
            c_pipelines: RwLock::new(IdTable::new(ResourceKind::ComputePipeline, TABLE_CAPACITY)),
            m_pipelines: RwLock::new(IdTable::new(ResourceKind::MeshPipeline, TABLE_CAPACITY)),
            rt_pipelines: RwLock::new(IdTable::new(
                ResourceKind::RayTracingPipeline,
                TABLE_CAPACITY,
            )),
            ds_layouts: RwLock::new(IdTable::new(
                ResourceKind::DescriptorSetLayout,
                TABLE_CAPACITY,
            )),
            render_passes: RwLock::new(IdTable::new(ResourceKind::RenderPass, TABLE_CAPACITY)),
            framebuffers: RwLock::new(IdTable::new(ResourceKind::Framebuffer, TABLE_CAPACITY)),
            swapchains: RwLock::new(IdTable::new(ResourceKind::Swapchain, 16)),
            intern: Mutex::new(FxHashMap::default()),
            slab: Mutex::new(SlabAllocator::new(heap_size, 256, MemoryType::DeviceLocal)),
            max_heaps,
            pending_destroy: Mutex::new(Vec::new()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Allocates device memory, growing the slab by whole heaps a bounded
    /// number of times.
    fn allocate_memory(&self, size: u64, align: u64) -> Result<MemoryBlock> {
        let mut slab = self.slab.lock();
        loop {
            if let Some(block) = slab.allocate(size, align) {
                return Ok(block);
            }
            if slab.heap_count() >= self.max_heaps || size > slab.heap_size() {
                return Err(Error::OutOfMemory);
            }
            let heap = self
                .driver
                .allocate_heap(slab.heap_size(), MemoryType::DeviceLocal)?;
            log::debug!(
                "growing device memory: heap #{} of {} bytes",
                slab.heap_count(),
                slab.heap_size()
            );
            slab.add_heap(heap);
        }
    }

    // -----------------------------------------------------------------------
    // Creation

    pub fn create_image(
        &self,
        desc: &ImageDesc,
        debug_name: Option<&str>,
    ) -> Result<ImageId> {
        if desc.dimensions.texel_count() == 0 || desc.levels == 0 {
            return Err(Error::ValidationFailed(format!(
                "image has no texels: {:?}",
                desc
            )));
        }
        let block = self.allocate_memory(desc.byte_size().max(1), 256)?;
        let device = match self
            .driver
            .create_image(desc, &MemoryBind::SubAllocated(block), debug_name)
        {
            Ok(device) => device,
            Err(e) => {
                self.slab.lock().free(block);
                return Err(e);
            }
        };
        let record = ImageRecord {
            desc: desc.clone(),
            device,
            memory: Some(block),
            alias_group: None,
            swapchain: None,
            debug_name: debug_name.map(str::to_owned),
            state: AccessState::default(),
            refs: new_refs(),
        };
        let raw = self.images.write().insert(record)?;
        Ok(ImageId::from_raw(raw))
    }

    /// Transient image for the current frame: memory comes from the frame's
    /// alias group, so the solver will fence it from other members.
    pub fn create_transient_image(
        &self,
        desc: &ImageDesc,
        alias_group: u32,
        debug_name: Option<&str>,
    ) -> Result<ImageId> {
        let device = self
            .driver
            .create_image(desc, &MemoryBind::Dedicated(MemoryType::DeviceLocal), debug_name)?;
        let record = ImageRecord {
            desc: desc.clone(),
            device,
            memory: None,
            alias_group: Some(alias_group),
            swapchain: None,
            debug_name: debug_name.map(str::to_owned),
            state: AccessState::default(),
            refs: new_refs(),
        };
        let raw = self.images.write().insert(record)?;
        Ok(ImageId::from_raw(raw))
    }

    pub fn create_buffer(
        &self,
        desc: &BufferDesc,
        debug_name: Option<&str>,
    ) -> Result<BufferId> {
        if desc.size == 0 {
            return Err(Error::ValidationFailed("zero-sized buffer".to_owned()));
        }
        let block = self.allocate_memory(desc.size, 256)?;
        let device = match self
            .driver
            .create_buffer(desc, &MemoryBind::SubAllocated(block), debug_name)
        {
            Ok(device) => device,
            Err(e) => {
                self.slab.lock().free(block);
                return Err(e);
            }
        };
        let record = BufferRecord {
            desc: desc.clone(),
            device,
            memory: Some(block),
            debug_name: debug_name.map(str::to_owned),
            state: AccessState::default(),
            refs: new_refs(),
        };
        let raw = self.buffers.write().insert(record)?;
        Ok(BufferId::from_raw(raw))
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId> {
        let hash = content_hash(desc);
        if let Some(raw) = self.intern_lookup(ResourceKind::Sampler, hash, |raw| {
            self.samplers
                .read()
                .get(raw)
                .map(|r| r.desc == *desc)
                .unwrap_or(false)
        }) {
            return Ok(SamplerId::from_raw(raw));
        }
        let device = self.driver.create_sampler(desc)?;
        let record = SamplerRecord {
            desc: *desc,
            device,
            hash,
            refs: new_refs(),
        };
        let raw = self.samplers.write().insert(record)?;
        self.intern_insert(ResourceKind::Sampler, hash, raw);
        Ok(SamplerId::from_raw(raw))
    }

    pub fn intern_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassId> {
        let hash = content_hash(desc);
        if let Some(raw) = self.intern_lookup(ResourceKind::RenderPass, hash, |raw| {
            self.render_passes
                .read()
                .get(raw)
                .map(|r| r.desc == *desc)
                .unwrap_or(false)
        }) {
            return Ok(RenderPassId::from_raw(raw));
        }
        let device = self.driver.create_render_pass(desc)?;
        let record = RenderPassRecord {
            desc: desc.clone(),
            device,
            hash,
            refs: new_refs(),
        };
        let raw = self.render_passes.write().insert(record)?;
        self.intern_insert(ResourceKind::RenderPass, hash, raw);
        Ok(RenderPassId::from_raw(raw))
    }

    pub fn intern_framebuffer(
        &self,
        render_pass: RenderPassId,
        attachments: &[ImageId],
        width: u32,
        height: u32,
    ) -> Result<FramebufferId> {
        let hash = content_hash(&(render_pass, attachments, width, height));
        if let Some(raw) = self.intern_lookup(ResourceKind::Framebuffer, hash, |raw| {
            self.framebuffers
                .read()
                .get(raw)
                .map(|r| {
                    r.render_pass == render_pass
                        && r.attachments == attachments
                        && (r.width, r.height) == (width, height)
                })
                .unwrap_or(false)
        }) {
            return Ok(FramebufferId::from_raw(raw));
        }
        let device_pass = self.render_passes.read().get(render_pass.raw())?.device;
        let device_attachments = {
            let images = self.images.read();
            attachments
                .iter()
                .map(|&id| images.get(id.raw()).map(|r| r.device))
                .collect::<Result<Vec<_>>>()?
        };
        let device =
            self.driver
                .create_framebuffer(device_pass, &device_attachments, width, height)?;
        let record = FramebufferRecord {
            render_pass,
            attachments: attachments.to_vec(),
            width,
            height,
            device,
            hash,
            refs: new_refs(),
        };
        let raw = self.framebuffers.write().insert(record)?;
        self.intern_insert(ResourceKind::Framebuffer, hash, raw);
        Ok(FramebufferId::from_raw(raw))
    }

    pub fn intern_ds_layout(
        &self,
        bindings: &[LayoutBindingDesc],
        uniforms: &[UniformSlot],
    ) -> Result<RawId> {
        let hash = content_hash(&bindings);
        if let Some(raw) = self.intern_lookup(ResourceKind::DescriptorSetLayout, hash, |raw| {
            self.ds_layouts
                .read()
                .get(raw)
                .map(|r| r.bindings == bindings)
                .unwrap_or(false)
        }) {
            return Ok(raw);
        }
        let device = self.driver.create_descriptor_set_layout(bindings)?;
        let record = DescriptorSetLayoutRecord {
            bindings: bindings.to_vec(),
            uniforms: uniforms.to_vec(),
            device,
            hash,
            refs: new_refs(),
        };
        let raw = self.ds_layouts.write().insert(record)?;
        self.intern_insert(ResourceKind::DescriptorSetLayout, hash, raw);
        Ok(raw)
    }

    /// Inserts a compiled pipeline record, or returns the existing equivalent
    /// one with an incremented refcount. The intern lock is held across the
    /// check and the insert, so two racing creations of equal descriptors
    /// still produce a single record.
    pub fn intern_pipeline(&self, record: PipelineRecord) -> Result<RawId> {
        let kind = record.kind;
        let hash = record.hash;
        let table = self.pipeline_table(kind);
        let mut intern = self.intern.lock();
        if let Some(chain) = intern.get(&(kind.resource_kind(), hash)) {
            let records = table.read();
            for &raw in chain.iter() {
                if let Ok(existing) = records.get(raw) {
                    if existing.hash == hash {
                        existing.refs.fetch_add(1, Ordering::Relaxed);
                        return Ok(raw);
                    }
                }
            }
        }
        let raw = table.write().insert(record)?;
        intern
            .entry((kind.resource_kind(), hash))
            .or_default()
            .push(raw);
        Ok(raw)
    }

    pub fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        debug_name: Option<&str>,
    ) -> Result<SwapchainId> {
        let (device, device_images) = self.driver.create_swapchain(desc)?;
        let image_desc = ImageDesc::new()
            .dimensions((desc.width, desc.height))
            .format(desc.format)
            .usage(crate::image::ImageUsage::COLOR_ATTACHMENT | crate::image::ImageUsage::TRANSFER_DST);
        let raw = self.swapchains.write().insert(SwapchainRecord {
            desc: desc.clone(),
            device,
            images: Vec::new(),
            refs: new_refs(),
        })?;
        let swapchain_id = SwapchainId::from_raw(raw);
        let mut images = Vec::with_capacity(device_images.len());
        {
            let mut table = self.images.write();
            for (index, device_image) in device_images.into_iter().enumerate() {
                let record = ImageRecord {
                    desc: image_desc.clone(),
                    device: device_image,
                    memory: None,
                    alias_group: None,
                    swapchain: Some((swapchain_id, index as u32)),
                    debug_name: debug_name.map(|n| format!("{}[{}]", n, index)),
                    state: AccessState::default(),
                    refs: new_refs(),
                };
                images.push(ImageId::from_raw(table.insert(record)?));
            }
        }
        self.swapchains.write().get_mut(raw)?.images = images;
        Ok(swapchain_id)
    }

    fn pipeline_table(&self, kind: PipelineKind) -> &RwLock<IdTable<PipelineRecord>> {
        match kind {
            PipelineKind::Graphics => &self.g_pipelines,
            PipelineKind::Compute => &self.c_pipelines,
            PipelineKind::Mesh => &self.m_pipelines,
            PipelineKind::RayTracing => &self.rt_pipelines,
        }
    }

    pub(crate) fn pipeline_table_for(&self, raw: RawId) -> Option<&RwLock<IdTable<PipelineRecord>>> {
        match raw.kind_bits() {
            k if k == ResourceKind::GraphicsPipeline as u8 => Some(&self.g_pipelines),
            k if k == ResourceKind::ComputePipeline as u8 => Some(&self.c_pipelines),
            k if k == ResourceKind::MeshPipeline as u8 => Some(&self.m_pipelines),
            k if k == ResourceKind::RayTracingPipeline as u8 => Some(&self.rt_pipelines),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Interning index

    fn intern_lookup(
        &self,
        kind: ResourceKind,
        hash: u64,
        deep_eq: impl Fn(RawId) -> bool,
    ) -> Option<RawId> {
        let intern = self.intern.lock();
        let chain = intern.get(&(kind, hash))?;
        // Hash collisions fall back to deep equality along the chain.
        let raw = chain.iter().copied().find(|&raw| deep_eq(raw))?;
        drop(intern);
        // Cache hit: hand out a new strong reference.
        let _ = self.add_ref(raw);
        Some(raw)
    }

    fn intern_insert(&self, kind: ResourceKind, hash: u64, raw: RawId) {
        self.intern
            .lock()
            .entry((kind, hash))
            .or_default()
            .push(raw);
    }

    fn intern_remove(&self, kind: ResourceKind, hash: u64, raw: RawId) {
        let mut intern = self.intern.lock();
        if let Some(chain) = intern.get_mut(&(kind, hash)) {
            chain.retain(|r| *r != raw);
            if chain.is_empty() {
                intern.remove(&(kind, hash));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reference counting

    fn with_refs<R>(&self, raw: RawId, f: impl FnOnce(&AtomicU32) -> R) -> Result<R> {
        macro_rules! table {
            ($field:ident) => {{
                let table = self.$field.read();
                let record = table.get(raw)?;
                Ok(f(record.refs()))
            }};
        }
        match raw.kind_bits() {
            k if k == ResourceKind::Image as u8 => table!(images),
            k if k == ResourceKind::Buffer as u8 => table!(buffers),
            k if k == ResourceKind::Sampler as u8 => table!(samplers),
            k if k == ResourceKind::GraphicsPipeline as u8 => table!(g_pipelines),
            k if k == ResourceKind::ComputePipeline as u8 => table!(c_pipelines),
            k if k == ResourceKind::MeshPipeline as u8 => table!(m_pipelines),
            k if k == ResourceKind::RayTracingPipeline as u8 => table!(rt_pipelines),
            k if k == ResourceKind::DescriptorSetLayout as u8 => table!(ds_layouts),
            k if k == ResourceKind::RenderPass as u8 => table!(render_passes),
            k if k == ResourceKind::Framebuffer as u8 => table!(framebuffers),
            k if k == ResourceKind::Swapchain as u8 => table!(swapchains),
            _ => Err(Error::InvalidHandle(raw)),
        }
    }

    /// Clones a strong reference. Fails with `InvalidHandle` on stale ids.
    pub fn add_ref(&self, raw: RawId) -> Result<RawId> {
        self.with_refs(raw, |refs| {
            refs.fetch_add(1, Ordering::Relaxed);
        })?;
        Ok(raw)
    }

    /// Drops a strong reference, returning the remaining count. Releasing a
    /// stale or fabricated handle is a warned no-op returning 0.
    pub fn release(&self, raw: RawId) -> u32 {
        let remaining = match self.with_refs(raw, |refs| refs.fetch_sub(1, Ordering::AcqRel) - 1) {
            Ok(remaining) => remaining,
            Err(_) => {
                log::warn!("release of invalid handle {:?} ignored", raw);
                return 0;
            }
        };
        if remaining == 0 {
            self.destroy(raw);
        }
        remaining
    }

    /// Removes the record and queues its driver objects for fence-gated
    /// deletion.
    fn destroy(&self, raw: RawId) {
        let mut retired: SmallVec<[RetiredObject; 4]> = SmallVec::new();
        let mut release_after: SmallVec<[RawId; 4]> = SmallVec::new();
        match raw.kind_bits() {
            k if k == ResourceKind::Image as u8 => {
                if let Ok(record) = self.images.write().remove(raw) {
                    // Swapchain images are owned by their swapchain.
                    if record.swapchain.is_none() {
                        retired.push(RetiredObject::Image(record.device, record.memory));
                    }
                }
            }
            k if k == ResourceKind::Buffer as u8 => {
                if let Ok(record) = self.buffers.write().remove(raw) {
                    retired.push(RetiredObject::Buffer(record.device, record.memory));
                }
            }
            k if k == ResourceKind::Sampler as u8 => {
                if let Ok(record) = self.samplers.write().remove(raw) {
                    self.intern_remove(ResourceKind::Sampler, record.hash, raw);
                    retired.push(RetiredObject::Sampler(record.device));
                }
            }
            k if k == ResourceKind::DescriptorSetLayout as u8 => {
                if let Ok(record) = self.ds_layouts.write().remove(raw) {
                    self.intern_remove(ResourceKind::DescriptorSetLayout, record.hash, raw);
                    retired.push(RetiredObject::DescriptorSetLayout(record.device));
                }
            }
            k if k == ResourceKind::RenderPass as u8 => {
                if let Ok(record) = self.render_passes.write().remove(raw) {
                    self.intern_remove(ResourceKind::RenderPass, record.hash, raw);
                    retired.push(RetiredObject::RenderPass(record.device));
                }
            }
            k if k == ResourceKind::Framebuffer as u8 => {
                if let Ok(record) = self.framebuffers.write().remove(raw) {
                    self.intern_remove(ResourceKind::Framebuffer, record.hash, raw);
                    retired.push(RetiredObject::Framebuffer(record.device));
                }
            }
            k if k == ResourceKind::Swapchain as u8 => {
                if let Ok(record) = self.swapchains.write().remove(raw) {
                    release_after.extend(record.images.iter().map(|id| id.raw()));
                    retired.push(RetiredObject::Swapchain(record.device));
                }
            }
            _ => {
                if let Some(table) = self.pipeline_table_for(raw) {
                    if let Ok(record) = table.write().remove(raw) {
                        if let Some(kind) = resource_kind_of(raw) {
                            self.intern_remove(kind, record.hash, raw);
                        }
                        for (_, pipeline) in record.variants.lock().drain() {
                            retired.push(RetiredObject::Pipeline(pipeline));
                        }
                    }
                } else {
                    log::warn!("destroy of unknown handle kind {:?}", raw);
                }
            }
        }
        if !retired.is_empty() {
            self.pending_destroy.lock().extend(retired);
        }
        for id in release_after {
            self.release(id);
        }
    }

    /// Drains destruction requests into the caller's retirement ring.
    pub fn take_pending_destroy(&self) -> Vec<RetiredObject> {
        std::mem::replace(&mut *self.pending_destroy.lock(), Vec::new())
    }

    /// Destroys retired driver objects; called once their frame's fence has
    /// signaled.
    pub fn delete_retired(&self, retired: Vec<RetiredObject>) {
        let mut slab = self.slab.lock();
        for object in retired {
            match object {
                RetiredObject::Image(device, memory) => {
                    self.driver.destroy_image(device);
                    if let Some(block) = memory {
                        slab.free(block);
                    }
                }
                RetiredObject::Buffer(device, memory) => {
                    self.driver.destroy_buffer(device);
                    if let Some(block) = memory {
                        slab.free(block);
                    }
                }
                RetiredObject::Sampler(device) => self.driver.destroy_sampler(device),
                RetiredObject::Pipeline(device) => self.driver.destroy_pipeline(device),
                RetiredObject::RenderPass(device) => self.driver.destroy_render_pass(device),
                RetiredObject::Framebuffer(device) => self.driver.destroy_framebuffer(device),
                RetiredObject::DescriptorSetLayout(device) => {
                    self.driver.destroy_descriptor_set_layout(device)
                }
                RetiredObject::Swapchain(device) => self.driver.destroy_swapchain(device),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lookup

    pub fn image_desc(&self, id: ImageId) -> Result<ImageDesc> {
        Ok(self.images.read().get(id.raw())?.desc.clone())
    }

    pub fn buffer_desc(&self, id: BufferId) -> Result<BufferDesc> {
        Ok(self.buffers.read().get(id.raw())?.desc.clone())
    }

    pub fn sampler_desc(&self, id: SamplerId) -> Result<SamplerDesc> {
        Ok(self.samplers.read().get(id.raw())?.desc)
    }

    pub fn swapchain_desc(&self, id: SwapchainId) -> Result<SwapchainDesc> {
        Ok(self.swapchains.read().get(id.raw())?.desc.clone())
    }

    pub fn image_device(&self, raw: RawId) -> Result<DeviceImage> {
        Ok(self.images.read().get(raw)?.device)
    }

    pub fn buffer_device(&self, raw: RawId) -> Result<DeviceBuffer> {
        Ok(self.buffers.read().get(raw)?.device)
    }

    pub fn contains(&self, raw: RawId) -> bool {
        self.with_refs(raw, |_| ()).is_ok()
    }

    pub fn debug_name(&self, raw: RawId) -> Option<String> {
        match raw.kind_bits() {
            k if k == ResourceKind::Image as u8 => {
                self.images.read().get(raw).ok()?.debug_name.clone()
            }
            k if k == ResourceKind::Buffer as u8 => {
                self.buffers.read().get(raw).ok()?.debug_name.clone()
            }
            _ => None,
        }
    }

    /// Populates an empty bindings table with the uniform slots of one
    /// reflected descriptor set, addressed by name.
    pub fn init_pipeline_resources(
        &self,
        resources: &mut crate::pipeline::resources::PipelineResources,
        pipeline: RawId,
        set: &crate::names::DescriptorSetId,
    ) -> Result<()> {
        let table = self
            .pipeline_table_for(pipeline)
            .ok_or(Error::InvalidHandle(pipeline))?;
        let records = table.read();
        let record = records.get(pipeline)?;
        let set = record.sets.iter().find(|s| &s.name == set).ok_or_else(|| {
            Error::ValidationFailed(format!("pipeline has no descriptor set {:?}", set))
        })?;
        resources.initialize(set.name.clone(), set.index, set.layout, set.uniforms.clone());
        Ok(())
    }

    /// Same as [`init_pipeline_resources`] but addressed by set index.
    ///
    /// [`init_pipeline_resources`]: ResourceManager::init_pipeline_resources
    pub fn init_pipeline_resources_by_index(
        &self,
        resources: &mut crate::pipeline::resources::PipelineResources,
        pipeline: RawId,
        index: u32,
    ) -> Result<()> {
        let table = self
            .pipeline_table_for(pipeline)
            .ok_or(Error::InvalidHandle(pipeline))?;
        let records = table.read();
        let record = records.get(pipeline)?;
        let set = record
            .sets
            .iter()
            .find(|s| s.index == index)
            .ok_or_else(|| {
                Error::ValidationFailed(format!("pipeline has no descriptor set #{}", index))
            })?;
        resources.initialize(set.name.clone(), set.index, set.layout, set.uniforms.clone());
        Ok(())
    }

    /// Snapshot of the tracked state of one image or buffer.
    pub fn access_state(&self, raw: RawId) -> Result<AccessState> {
        match raw.kind_bits() {
            k if k == ResourceKind::Image as u8 => Ok(self.images.read().get(raw)?.state),
            k if k == ResourceKind::Buffer as u8 => Ok(self.buffers.read().get(raw)?.state),
            _ => Err(Error::InvalidHandle(raw)),
        }
    }

    pub fn image_alias_group(&self, raw: RawId) -> Option<u32> {
        self.images.read().get(raw).ok()?.alias_group
    }

    /// Reconciles the solver's shadow states after a submission. Called
    /// under the submission lock, in batch order.
    pub fn apply_access_states(&self, states: &[(RawId, AccessState)]) {
        let mut images = self.images.write();
        let mut buffers = self.buffers.write();
        for (raw, state) in states {
            match raw.kind_bits() {
                k if k == ResourceKind::Image as u8 => {
                    if let Ok(record) = images.get_mut(*raw) {
                        record.state = *state;
                    }
                }
                k if k == ResourceKind::Buffer as u8 => {
                    if let Ok(record) = buffers.get_mut(*raw) {
                        record.state = *state;
                    }
                }
                _ => {}
            }
        }
    }
}

fn resource_kind_of(raw: RawId) -> Option<ResourceKind> {
    use self::ResourceKind::*;
    Some(match raw.kind_bits() {
        k if k == Image as u8 => Image,
        k if k == Buffer as u8 => Buffer,
        k if k == Sampler as u8 => Sampler,
        k if k == PipelineLayout as u8 => PipelineLayout,
        k if k == GraphicsPipeline as u8 => GraphicsPipeline,
        k if k == ComputePipeline as u8 => ComputePipeline,
        k if k == MeshPipeline as u8 => MeshPipeline,
        k if k == RayTracingPipeline as u8 => RayTracingPipeline,
        k if k == RenderPass as u8 => RenderPass,
        k if k == Framebuffer as u8 => Framebuffer,
        k if k == DescriptorSetLayout as u8 => DescriptorSetLayout,
        k if k == DescriptorSet as u8 => DescriptorSet,
        k if k == Swapchain as u8 => Swapchain,
        k if k == MemoryBlock as u8 => MemoryBlock,
        _ => return None,
    })
}

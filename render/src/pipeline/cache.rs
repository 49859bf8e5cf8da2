//! The shared pipeline and descriptor cache.
//!
//! Pipelines are interned by content (shader fingerprints + layout + state
//! vector); device pipeline objects are instantiated lazily per render-pass
//! compatibility key. Both levels resolve concurrent misses on the same key
//! through a single-flight slot: one thread compiles, the others wait on the
//! result.
//!
//! Descriptor sets are allocated from per-frame pools and interned by the
//! content hash of their [`PipelineResources`] table; pools are reset as a
//! whole when their frame retires.

use super::resources::{BoundValue, PipelineResources};
use super::{DescriptorType, GraphicsState, PushConstantRange, ShaderStageDesc};
use crate::driver::{
    ComputePipelineCreateInfo, DescriptorValue, DescriptorWrite, DeviceDescriptorPool,
    DeviceDescriptorSet, DevicePipeline, DevicePipelineLayout, DeviceSampler, Driver,
    FeatureFlags, GraphicsPipelineCreateInfo, LayoutBindingDesc, RenderPassDesc, ShaderCompiler,
    StageBytecode,
};
use crate::error::{Error, Result};
use crate::handle::RawId;
use crate::names::DescriptorSetId;
use crate::pipeline::resources::UniformSlot;
use crate::resource::{PipelineKind, PipelineRecord, PipelineSetLayout, ResourceManager};
use crate::sync::ImageLayout;
use crate::util::content_hash;
use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Single-flight table: the first thread to miss a key computes it, every
/// concurrent miss blocks until the result lands.
struct SingleFlight<V: Clone> {
    slots: Mutex<FxHashMap<u64, Option<V>>>,
    ready: Condvar,
}

impl<V: Clone> SingleFlight<V> {
    fn new() -> SingleFlight<V> {
        SingleFlight {
            slots: Mutex::new(FxHashMap::default()),
            ready: Condvar::new(),
        }
    }

    fn get_or_compute(&self, key: u64, compute: impl FnOnce() -> Result<V>) -> Result<V> {
        {
            let mut slots = self.slots.lock();
            loop {
                match slots.get(&key) {
                    Some(Some(v)) => return Ok(v.clone()),
                    Some(None) => {
                        // Another thread is compiling this key.
                        self.ready.wait(&mut slots);
                    }
                    None => {
                        slots.insert(key, None);
                        break;
                    }
                }
            }
        }
        let result = compute();
        let mut slots = self.slots.lock();
        match &result {
            Ok(v) => {
                slots.insert(key, Some(v.clone()));
            }
            Err(_) => {
                // Let the next caller retry instead of caching the failure.
                slots.remove(&key);
            }
        }
        self.ready.notify_all();
        result
    }

    fn remove(&self, key: u64) {
        self.slots.lock().remove(&key);
    }
}

/// Descriptor pool + interned sets for one frame slot.
struct FramePool {
    pool: DeviceDescriptorPool,
    sets: FxHashMap<u64, DeviceDescriptorSet>,
}

pub struct PipelineCache {
    driver: Arc<dyn Driver>,
    compiler: Arc<dyn ShaderCompiler>,
    /// Keyed by `(pipeline, render-pass compatibility)` hash.
    variants: SingleFlight<DevicePipeline>,
    frame_pools: Mutex<Vec<FramePool>>,
    /// Device samplers for combined image samplers, interned by descriptor.
    samplers: Mutex<FxHashMap<u64, DeviceSampler>>,
}

impl PipelineCache {
    pub fn new(
        driver: Arc<dyn Driver>,
        compiler: Arc<dyn ShaderCompiler>,
        frames_in_flight: usize,
        sets_per_frame: u32,
    ) -> Result<PipelineCache> {
        let mut pools = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            pools.push(FramePool {
                pool: driver.create_descriptor_pool(sets_per_frame)?,
                sets: FxHashMap::default(),
            });
        }
        Ok(PipelineCache {
            driver,
            compiler,
            variants: SingleFlight::new(),
            frame_pools: Mutex::new(pools),
            samplers: Mutex::new(FxHashMap::default()),
        })
    }

    // -----------------------------------------------------------------------
    // Pipeline creation

    /// Compiles and interns a pipeline. Returns the existing handle (with an
    /// incremented refcount) when an equivalent descriptor was seen before.
    pub fn create_pipeline(
        &self,
        manager: &ResourceManager,
        kind: PipelineKind,
        shaders: &[ShaderStageDesc],
        graphics: Option<GraphicsState>,
        features: FeatureFlags,
        debug_name: Option<&str>,
    ) -> Result<RawId> {
        if shaders.is_empty() {
            return Err(Error::ValidationFailed(
                "pipeline descriptor has no shader stages".to_owned(),
            ));
        }

        // Compile first: fingerprints are part of the interning key.
        let mut stages = Vec::with_capacity(shaders.len());
        for shader in shaders {
            let compiled = self
                .compiler
                .compile(&shader.source, shader.stage, &shader.entry_point, features)
                .map_err(|e| match e {
                    Error::CompileFailed(msg) => Error::CompileFailed(match &shader.debug_name {
                        Some(name) => format!("{}: {}", name, msg),
                        None => msg,
                    }),
                    other => other,
                })?;
            stages.push(compiled);
        }

        let fingerprints: Vec<u64> = stages.iter().map(|s| s.fingerprint).collect();
        let key = content_hash(&(kind.resource_kind() as u8, &fingerprints, &graphics));

        {
            let (sets, layout) = self.build_layout(manager, &stages)?;
            let mut push_constants: Vec<PushConstantRange> = Vec::new();
            let mut reflection = crate::pipeline::ShaderReflection::default();
            for stage in &stages {
                for range in &stage.reflection.push_constants {
                    if !push_constants.iter().any(|r| r.id == range.id) {
                        push_constants.push(range.clone());
                    }
                }
                reflection
                    .vertex_inputs
                    .extend(stage.reflection.vertex_inputs.iter().cloned());
                if stage.reflection.local_size != [0; 3] {
                    reflection.local_size = stage.reflection.local_size;
                }
            }

            let record = PipelineRecord {
                kind,
                stages: stages.clone(),
                stage_names: shaders.iter().map(|s| s.debug_name.clone()).collect(),
                sets,
                push_constants,
                reflection,
                layout,
                graphics: graphics.clone(),
                hash: key,
                debug_name: debug_name.map(str::to_owned),
                variants: Mutex::new(FxHashMap::default()),
                refs: crate::resource::new_refs(),
            };
            manager.intern_pipeline(record)
        }
    }

    /// Groups reflected bindings by set, interns one descriptor-set layout
    /// per set and assembles the device pipeline layout.
    fn build_layout(
        &self,
        manager: &ResourceManager,
        stages: &[crate::driver::CompiledShader],
    ) -> Result<(Vec<PipelineSetLayout>, DevicePipelineLayout)> {
        let mut per_set: FxHashMap<u32, Vec<UniformSlot>> = FxHashMap::default();
        let mut set_names: FxHashMap<u32, DescriptorSetId> = FxHashMap::default();
        for stage in stages {
            for (index, name) in &stage.reflection.set_names {
                set_names.entry(*index).or_insert_with(|| name.clone());
            }
            for binding in &stage.reflection.bindings {
                let slots = per_set.entry(binding.set).or_default();
                match slots
                    .iter_mut()
                    .find(|s| s.binding == binding.binding && s.uniform == binding.uniform)
                {
                    Some(slot) => slot.stages |= binding.stages,
                    None => slots.push(UniformSlot {
                        uniform: binding.uniform.clone(),
                        binding: binding.binding,
                        descriptor_type: binding.descriptor_type,
                        count: binding.count,
                        stages: binding.stages,
                        value: BoundValue::Unbound,
                    }),
                }
            }
        }

        let mut set_indices: Vec<u32> = per_set.keys().copied().collect();
        set_indices.sort_unstable();

        let mut sets = Vec::with_capacity(set_indices.len());
        let mut device_layouts = Vec::with_capacity(set_indices.len());
        for index in set_indices {
            let mut uniforms = per_set.remove(&index).unwrap();
            uniforms.sort_by_key(|s| s.binding);
            let bindings: Vec<LayoutBindingDesc> = uniforms
                .iter()
                .map(|s| LayoutBindingDesc {
                    binding: s.binding,
                    descriptor_type: s.descriptor_type,
                    count: s.count,
                    stages: s.stages,
                })
                .collect();
            let layout = manager.intern_ds_layout(&bindings, &uniforms)?;
            device_layouts.push(manager.ds_layouts.read().get(layout)?.device);
            let name = set_names
                .get(&index)
                .cloned()
                .unwrap_or_else(|| DescriptorSetId::new(index.to_string()));
            sets.push(PipelineSetLayout {
                index,
                name,
                layout,
                uniforms,
            });
        }

        let mut push_constants = Vec::new();
        for stage in stages {
            for range in &stage.reflection.push_constants {
                if !push_constants.iter().any(|r: &PushConstantRange| r.id == range.id) {
                    push_constants.push(range.clone());
                }
            }
        }

        Ok((
            sets,
            DevicePipelineLayout {
                set_layouts: device_layouts,
                push_constants,
            },
        ))
    }

    // -----------------------------------------------------------------------
    // Device pipeline variants

    /// Returns the device pipeline for `pipeline` under the given render-pass
    /// compatibility, instantiating it on first use. Compute and ray-tracing
    /// pipelines use an empty compatibility descriptor.
    pub fn device_pipeline(
        &self,
        manager: &ResourceManager,
        pipeline: RawId,
        compat: Option<&RenderPassDesc>,
    ) -> Result<DevicePipeline> {
        let compat_hash = compat.map(content_hash).unwrap_or(0);
        let table = manager
            .pipeline_table_for(pipeline)
            .ok_or(Error::InvalidHandle(pipeline))?;

        // Fast path: already instantiated.
        {
            let records = table.read();
            let record = records.get(pipeline)?;
            let cached = record.variants.lock().get(&compat_hash).copied();
            if let Some(device) = cached {
                return Ok(device);
            }
        }

        let key = content_hash(&(pipeline, compat_hash));
        let device = self.variants.get_or_compute(key, || {
            let records = table.read();
            let record = records.get(pipeline)?;
            let device = match record.kind {
                PipelineKind::Compute => {
                    let stage = &record.stages[0];
                    self.driver.create_compute_pipeline(&ComputePipelineCreateInfo {
                        stage: &StageBytecode {
                            stage: stage.stage,
                            entry_point: stage.entry_point.clone(),
                            bytecode: stage.bytecode.clone(),
                        },
                        layout: &record.layout,
                    })?
                }
                PipelineKind::Graphics | PipelineKind::Mesh => {
                    let compat = compat.ok_or_else(|| {
                        Error::ValidationFailed(
                            "graphics pipeline used outside a render pass".to_owned(),
                        )
                    })?;
                    let render_pass = manager.intern_render_pass(compat)?;
                    let device_pass = manager.render_passes.read().get(render_pass.raw())?.device;
                    let stages: Vec<StageBytecode> = record
                        .stages
                        .iter()
                        .map(|s| StageBytecode {
                            stage: s.stage,
                            entry_point: s.entry_point.clone(),
                            bytecode: s.bytecode.clone(),
                        })
                        .collect();
                    let state = record.graphics.clone().unwrap_or_default();
                    self.driver.create_graphics_pipeline(&GraphicsPipelineCreateInfo {
                        stages: &stages,
                        layout: &record.layout,
                        render_pass: device_pass,
                        vertex_input: &state.vertex_input,
                        input_assembly: state.input_assembly,
                        rasterization: state.rasterization,
                        depth_stencil: state.depth_stencil,
                        color_blend: &state.color_blend,
                    })?
                }
                PipelineKind::RayTracing => {
                    let stages: Vec<StageBytecode> = record
                        .stages
                        .iter()
                        .map(|s| StageBytecode {
                            stage: s.stage,
                            entry_point: s.entry_point.clone(),
                            bytecode: s.bytecode.clone(),
                        })
                        .collect();
                    self.driver
                        .create_ray_tracing_pipeline(&crate::driver::RayTracingPipelineCreateInfo {
                            stages: &stages,
                            layout: &record.layout,
                            max_recursion_depth: 1,
                        })?
                }
            };
            record.variants.lock().insert(compat_hash, device);
            Ok(device)
        });
        // The slot only coalesces the in-flight compile; the durable cache is
        // the record's variant map.
        self.variants.remove(key);
        device
    }

    // -----------------------------------------------------------------------
    // Descriptor sets

    /// Looks up or allocates the descriptor set for one bindings table in one
    /// frame slot. Binding the same table twice in a frame returns the same
    /// set; descriptors are written in a single batched driver call on
    /// allocation.
    pub fn descriptor_set(
        &self,
        manager: &ResourceManager,
        frame_slot: usize,
        resources: &PipelineResources,
    ) -> Result<DeviceDescriptorSet> {
        let hash = resources.content_hash();
        let mut pools = self.frame_pools.lock();
        let frame = &mut pools[frame_slot];
        if let Some(&set) = frame.sets.get(&hash) {
            return Ok(set);
        }

        let layout_device = manager.ds_layouts.read().get(resources.layout())?.device;
        let set = self.driver.allocate_descriptor_set(frame.pool, layout_device)?;

        let mut writes = Vec::with_capacity(resources.slots().len());
        for slot in resources.slots() {
            let value = match (&slot.value, slot.descriptor_type) {
                (BoundValue::Unbound, _) => {
                    log::warn!("descriptor {:?} left unbound", slot.uniform);
                    continue;
                }
                (BoundValue::Image(id), DescriptorType::StorageImage)
                | (BoundValue::ImageView { image: id, .. }, DescriptorType::StorageImage) => {
                    DescriptorValue::StorageImage {
                        image: manager.image_device(id.raw())?,
                    }
                }
                (BoundValue::Image(id), _) | (BoundValue::ImageView { image: id, .. }, _) => {
                    DescriptorValue::SampledImage {
                        image: manager.image_device(id.raw())?,
                        layout: ImageLayout::ShaderReadOnly,
                    }
                }
                (BoundValue::Texture { image, sampler }, _) => {
                    DescriptorValue::CombinedImageSampler {
                        image: manager.image_device(image.raw())?,
                        layout: ImageLayout::ShaderReadOnly,
                        sampler: self.device_sampler(sampler)?,
                    }
                }
                (BoundValue::Sampler(id), _) => {
                    DescriptorValue::Sampler(manager.samplers.read().get(id.raw())?.device)
                }
                (BoundValue::Buffer { buffer, range }, ty) => {
                    let device = manager.buffer_device(buffer.raw())?;
                    let desc = manager.buffer_desc(*buffer)?;
                    let (offset, size) = match range {
                        Some(r) => (r.offset, r.size),
                        None => (0, desc.size),
                    };
                    match ty {
                        DescriptorType::UniformBuffer => DescriptorValue::UniformBuffer {
                            buffer: device,
                            offset,
                            size,
                        },
                        _ => DescriptorValue::StorageBuffer {
                            buffer: device,
                            offset,
                            size,
                        },
                    }
                }
                (BoundValue::BufferView { buffer, format, .. }, ty) => {
                    let device = manager.buffer_device(buffer.raw())?;
                    match ty {
                        DescriptorType::StorageTexelBuffer => DescriptorValue::StorageTexelBuffer {
                            buffer: device,
                            format: *format,
                        },
                        _ => DescriptorValue::UniformTexelBuffer {
                            buffer: device,
                            format: *format,
                        },
                    }
                }
                (BoundValue::RayTracingScene(scene), _) => DescriptorValue::StorageBuffer {
                    buffer: manager.buffer_device(scene.raw())?,
                    offset: 0,
                    size: manager.buffer_desc(*scene)?.size,
                },
            };
            writes.push(DescriptorWrite {
                binding: slot.binding,
                array_index: 0,
                value,
            });
        }
        self.driver.update_descriptor_set(set, &writes)?;
        frame.sets.insert(hash, set);
        Ok(set)
    }

    fn device_sampler(&self, desc: &crate::sampler::SamplerDesc) -> Result<DeviceSampler> {
        let hash = content_hash(desc);
        let mut samplers = self.samplers.lock();
        if let Some(&device) = samplers.get(&hash) {
            return Ok(device);
        }
        let device = self.driver.create_sampler(desc)?;
        samplers.insert(hash, device);
        Ok(device)
    }

    /// Resets one frame slot's pool after its fence signaled. The whole pool
    /// is recycled; there is no per-set free path.
    pub fn retire_frame(&self, frame_slot: usize) -> Result<()> {
        let mut pools = self.frame_pools.lock();
        let frame = &mut pools[frame_slot];
        frame.sets.clear();
        self.driver.reset_descriptor_pool(frame.pool)
    }
}

//! The pipeline-resources binding table.
//!
//! A [`PipelineResources`] is a copy-on-write table mapping uniform names to
//! concrete resources for one descriptor set. The table is content-hashed;
//! the descriptor cache uses the hash to intern one device descriptor set per
//! distinct table per frame.

use super::{DescriptorType, ShaderStageFlags};
use crate::buffer::BufferRange;
use crate::format::Format;
use crate::handle::{BufferId, ImageId, RawId, SamplerId};
use crate::image::ImageSubresourceRange;
use crate::names::{DescriptorSetId, UniformId};
use crate::sampler::SamplerDesc;
use crate::sync::{AccessFlags, ImageLayout, StageFlags};
use crate::util::content_hash;
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// What is currently bound to one uniform slot.
#[derive(Clone, Debug, PartialEq)]
pub enum BoundValue {
    Unbound,
    Image(ImageId),
    ImageView {
        image: ImageId,
        range: ImageSubresourceRange,
    },
    /// Combined image + sampler.
    Texture {
        image: ImageId,
        sampler: SamplerDesc,
    },
    Sampler(SamplerId),
    Buffer {
        buffer: BufferId,
        range: Option<BufferRange>,
    },
    BufferView {
        buffer: BufferId,
        format: Format,
        range: Option<BufferRange>,
    },
    RayTracingScene(BufferId),
}

impl BoundValue {
    fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            BoundValue::Unbound => 0u8.hash(state),
            BoundValue::Image(id) => {
                1u8.hash(state);
                id.hash(state);
            }
            BoundValue::ImageView { image, range } => {
                2u8.hash(state);
                image.hash(state);
                range.hash(state);
            }
            BoundValue::Texture { image, sampler } => {
                3u8.hash(state);
                image.hash(state);
                sampler.hash(state);
            }
            BoundValue::Sampler(id) => {
                4u8.hash(state);
                id.hash(state);
            }
            BoundValue::Buffer { buffer, range } => {
                5u8.hash(state);
                buffer.hash(state);
                range.hash(state);
            }
            BoundValue::BufferView {
                buffer,
                format,
                range,
            } => {
                6u8.hash(state);
                buffer.hash(state);
                format.hash(state);
                range.hash(state);
            }
            BoundValue::RayTracingScene(id) => {
                7u8.hash(state);
                id.hash(state);
            }
        }
    }
}

/// One uniform slot of the table, populated from shader reflection.
#[derive(Clone, Debug)]
pub struct UniformSlot {
    pub uniform: UniformId,
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: ShaderStageFlags,
    pub value: BoundValue,
}

#[derive(Clone, Debug, Default)]
struct Inner {
    set_name: Option<DescriptorSetId>,
    set_index: u32,
    /// Descriptor-set layout handle this table was initialized against.
    layout: RawId,
    slots: Vec<UniformSlot>,
    /// Names bound that reflection does not know; reported at task recording.
    unknown: SmallVec<[UniformId; 1]>,
}

/// Copy-on-write uniform bindings table for one descriptor set.
#[derive(Clone, Debug, Default)]
pub struct PipelineResources {
    inner: Arc<Inner>,
}

impl PipelineResources {
    pub fn new() -> PipelineResources {
        Default::default()
    }

    /// Called by the façade's `init_pipeline_resources`: resets the table to
    /// the uniform slots of one reflected descriptor set.
    pub(crate) fn initialize(
        &mut self,
        set_name: DescriptorSetId,
        set_index: u32,
        layout: RawId,
        slots: Vec<UniformSlot>,
    ) {
        self.inner = Arc::new(Inner {
            set_name: Some(set_name),
            set_index,
            layout,
            slots,
            unknown: SmallVec::new(),
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.set_name.is_some()
    }

    pub fn set_name(&self) -> Option<&DescriptorSetId> {
        self.inner.set_name.as_ref()
    }

    pub fn set_index(&self) -> u32 {
        self.inner.set_index
    }

    pub(crate) fn layout(&self) -> RawId {
        self.inner.layout
    }

    pub fn slots(&self) -> &[UniformSlot] {
        &self.inner.slots
    }

    /// Uniform names bound past initialization that the layout does not
    /// declare. Non-empty tables fail task validation.
    pub fn unknown_uniforms(&self) -> &[UniformId] {
        &self.inner.unknown
    }

    /// Uniform slots still [`BoundValue::Unbound`].
    pub fn unbound_uniforms(&self) -> impl Iterator<Item = &UniformId> {
        self.inner
            .slots
            .iter()
            .filter(|s| s.value == BoundValue::Unbound)
            .map(|s| &s.uniform)
    }

    fn bind(&mut self, uniform: impl Into<UniformId>, value: BoundValue) -> &mut Self {
        let uniform = uniform.into();
        let inner = Arc::make_mut(&mut self.inner);
        match inner.slots.iter_mut().find(|s| s.uniform == uniform) {
            Some(slot) => slot.value = value,
            None => {
                log::warn!("binding unknown uniform {:?}", uniform);
                inner.unknown.push(uniform);
            }
        }
        self
    }

    pub fn bind_image(&mut self, uniform: impl Into<UniformId>, image: ImageId) -> &mut Self {
        self.bind(uniform, BoundValue::Image(image))
    }

    pub fn bind_image_view(
        &mut self,
        uniform: impl Into<UniformId>,
        image: ImageId,
        range: ImageSubresourceRange,
    ) -> &mut Self {
        self.bind(uniform, BoundValue::ImageView { image, range })
    }

    pub fn bind_texture(
        &mut self,
        uniform: impl Into<UniformId>,
        image: ImageId,
        sampler: SamplerDesc,
    ) -> &mut Self {
        self.bind(uniform, BoundValue::Texture { image, sampler })
    }

    pub fn bind_sampler(&mut self, uniform: impl Into<UniformId>, sampler: SamplerId) -> &mut Self {
        self.bind(uniform, BoundValue::Sampler(sampler))
    }

    pub fn bind_buffer(&mut self, uniform: impl Into<UniformId>, buffer: BufferId) -> &mut Self {
        self.bind(
            uniform,
            BoundValue::Buffer {
                buffer,
                range: None,
            },
        )
    }

    pub fn bind_buffer_range(
        &mut self,
        uniform: impl Into<UniformId>,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> &mut Self {
        self.bind(
            uniform,
            BoundValue::Buffer {
                buffer,
                range: Some(BufferRange { offset, size }),
            },
        )
    }

    pub fn bind_buffer_view(
        &mut self,
        uniform: impl Into<UniformId>,
        buffer: BufferId,
        format: Format,
    ) -> &mut Self {
        self.bind(
            uniform,
            BoundValue::BufferView {
                buffer,
                format,
                range: None,
            },
        )
    }

    pub fn bind_ray_tracing_scene(
        &mut self,
        uniform: impl Into<UniformId>,
        scene: BufferId,
    ) -> &mut Self {
        self.bind(uniform, BoundValue::RayTracingScene(scene))
    }

    /// Content hash used to intern descriptor sets: identical tables bound to
    /// the same layout in the same frame share one set.
    pub fn content_hash(&self) -> u64 {
        struct Keyed<'a>(&'a Inner);
        impl<'a> Hash for Keyed<'a> {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.0.layout.hash(state);
                self.0.set_index.hash(state);
                for slot in &self.0.slots {
                    slot.binding.hash(state);
                    slot.descriptor_type.hash(state);
                    slot.value.hash_into(state);
                }
            }
        }
        content_hash(&Keyed(&self.inner))
    }

    /// Declared accesses of every bound resource, used by the task
    /// processor. `stage_mask` maps the reflected shader stages onto
    /// pipeline stages.
    pub(crate) fn declared_accesses(
        &self,
    ) -> impl Iterator<Item = (RawId, AccessFlags, StageFlags, Option<ImageLayout>)> + '_ {
        self.inner.slots.iter().filter_map(|slot| {
            let stage = shader_stages_to_pipeline_stages(slot.stages);
            match (&slot.value, slot.descriptor_type) {
                (BoundValue::Image(id), DescriptorType::StorageImage)
                | (BoundValue::ImageView { image: id, .. }, DescriptorType::StorageImage) => Some((
                    id.raw(),
                    AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
                    stage,
                    Some(ImageLayout::General),
                )),
                (BoundValue::Image(id), _) | (BoundValue::ImageView { image: id, .. }, _) => Some((
                    id.raw(),
                    AccessFlags::SHADER_READ,
                    stage,
                    Some(ImageLayout::ShaderReadOnly),
                )),
                (BoundValue::Texture { image, .. }, _) => Some((
                    image.raw(),
                    AccessFlags::SHADER_READ,
                    stage,
                    Some(ImageLayout::ShaderReadOnly),
                )),
                (BoundValue::Buffer { buffer, .. }, DescriptorType::UniformBuffer) => {
                    Some((buffer.raw(), AccessFlags::UNIFORM_READ, stage, None))
                }
                (BoundValue::Buffer { buffer, .. }, _)
                | (BoundValue::BufferView { buffer, .. }, _) => Some((
                    buffer.raw(),
                    AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
                    stage,
                    None,
                )),
                (BoundValue::RayTracingScene(scene), _) => Some((
                    scene.raw(),
                    AccessFlags::ACCELERATION_STRUCTURE_READ,
                    stage,
                    None,
                )),
                (BoundValue::Sampler(_), _) | (BoundValue::Unbound, _) => None,
            }
        })
    }
}

/// Maps reflected shader stages onto the pipeline stages used by barriers.
pub fn shader_stages_to_pipeline_stages(stages: ShaderStageFlags) -> StageFlags {
    let mut out = StageFlags::empty();
    if stages.contains(ShaderStageFlags::VERTEX) {
        out |= StageFlags::VERTEX_SHADER;
    }
    if stages.contains(ShaderStageFlags::TESS_CONTROL) {
        out |= StageFlags::TESS_CONTROL_SHADER;
    }
    if stages.contains(ShaderStageFlags::TESS_EVAL) {
        out |= StageFlags::TESS_EVAL_SHADER;
    }
    if stages.contains(ShaderStageFlags::GEOMETRY) {
        out |= StageFlags::GEOMETRY_SHADER;
    }
    if stages.contains(ShaderStageFlags::FRAGMENT) {
        out |= StageFlags::FRAGMENT_SHADER;
    }
    if stages.contains(ShaderStageFlags::COMPUTE) {
        out |= StageFlags::COMPUTE_SHADER;
    }
    if stages.contains(ShaderStageFlags::TASK) {
        out |= StageFlags::TASK_SHADER;
    }
    if stages.contains(ShaderStageFlags::MESH) {
        out |= StageFlags::MESH_SHADER;
    }
    if stages.intersects(ShaderStageFlags::ALL_RAY_TRACING) {
        out |= StageFlags::RAY_TRACING_SHADER;
    }
    if out.is_empty() {
        out = StageFlags::ALL_COMMANDS;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{IdTable, ResourceKind};

    fn slots() -> Vec<UniformSlot> {
        vec![
            UniformSlot {
                uniform: "un_OutImage".into(),
                binding: 0,
                descriptor_type: DescriptorType::StorageImage,
                count: 1,
                stages: ShaderStageFlags::COMPUTE,
                value: BoundValue::Unbound,
            },
            UniformSlot {
                uniform: "SSB".into(),
                binding: 1,
                descriptor_type: DescriptorType::StorageBuffer,
                count: 1,
                stages: ShaderStageFlags::COMPUTE,
                value: BoundValue::Unbound,
            },
        ]
    }

    fn image_id() -> ImageId {
        let mut table = IdTable::new(ResourceKind::Image, 4);
        ImageId::from_raw(table.insert(()).unwrap())
    }

    #[test]
    fn same_bindings_same_hash() {
        let img = image_id();
        let mut a = PipelineResources::new();
        a.initialize("0".into(), 0, RawId::NULL, slots());
        let mut b = a.clone();
        a.bind_image("un_OutImage", img);
        b.bind_image("un_OutImage", img);
        assert_eq!(a.content_hash(), b.content_hash());
        b.bind_image("un_OutImage", ImageId::null());
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn clone_is_copy_on_write() {
        let img = image_id();
        let mut a = PipelineResources::new();
        a.initialize("0".into(), 0, RawId::NULL, slots());
        let snapshot = a.clone();
        a.bind_image("un_OutImage", img);
        // The clone still sees the unbound slot.
        assert_eq!(snapshot.unbound_uniforms().count(), 2);
        assert_eq!(a.unbound_uniforms().count(), 1);
    }

    #[test]
    fn unknown_uniforms_are_reported() {
        let mut a = PipelineResources::new();
        a.initialize("0".into(), 0, RawId::NULL, slots());
        a.bind_image("no_such_uniform", image_id());
        assert_eq!(a.unknown_uniforms().len(), 1);
    }

    #[test]
    fn storage_image_access_is_read_write_general() {
        let img = image_id();
        let mut a = PipelineResources::new();
        a.initialize("0".into(), 0, RawId::NULL, slots());
        a.bind_image("un_OutImage", img);
        let accesses: Vec<_> = a.declared_accesses().collect();
        assert_eq!(accesses.len(), 1);
        let (id, access, stage, layout) = &accesses[0];
        assert_eq!(*id, img.raw());
        assert!(access.contains(AccessFlags::SHADER_WRITE));
        assert_eq!(*stage, StageFlags::COMPUTE_SHADER);
        assert_eq!(*layout, Some(ImageLayout::General));
    }
}

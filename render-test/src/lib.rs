//! Test fixtures for chroma-render and friends.
//!
//! Builds a frame graph over the software driver and offers small helpers
//! for registering closure shaders with hand-written reflection.

use chroma_render::pipeline::{
    DescriptorType, PushConstantRange, ReflectedBinding, ShaderReflection, ShaderStageFlags,
};
use chroma_render::{FrameGraph, FrameGraphConfig};
use chroma_render_soft::{ShaderRegistry, SoftCompiler, SoftDriver};
use std::sync::Arc;
use std::sync::Once;

pub use chroma_render_soft::{ComputeInvocation, FragmentInput, VertexInput, VertexOutput};

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = pretty_env_logger::try_init();
    });
}

/// Runs `f` with a shader registry and a frame graph over the software
/// driver.
pub fn with_frame_graph<F>(f: F)
where
    F: FnOnce(&Arc<ShaderRegistry>, &FrameGraph),
{
    init_logger();
    let registry = ShaderRegistry::new();
    let driver = SoftDriver::new(registry.clone());
    let compiler = Arc::new(SoftCompiler::new(registry.clone()));
    let fg = FrameGraph::new(driver, compiler, FrameGraphConfig::default())
        .expect("frame graph creation failed");
    f(&registry, &fg);
}

/// Builder for hand-written shader reflection records.
#[derive(Default)]
pub struct Reflect {
    reflection: ShaderReflection,
}

impl Reflect {
    pub fn new() -> Reflect {
        Default::default()
    }

    pub fn local_size(mut self, size: [u32; 3]) -> Self {
        self.reflection.local_size = size;
        self
    }

    fn binding(
        mut self,
        set: u32,
        binding: u32,
        name: &str,
        descriptor_type: DescriptorType,
        stages: ShaderStageFlags,
    ) -> Self {
        self.reflection.bindings.push(ReflectedBinding {
            set,
            binding,
            uniform: name.into(),
            descriptor_type,
            count: 1,
            stages,
        });
        self
    }

    pub fn storage_image(self, set: u32, binding: u32, name: &str) -> Self {
        self.binding(
            set,
            binding,
            name,
            DescriptorType::StorageImage,
            ShaderStageFlags::COMPUTE,
        )
    }

    pub fn storage_buffer(self, set: u32, binding: u32, name: &str) -> Self {
        self.binding(
            set,
            binding,
            name,
            DescriptorType::StorageBuffer,
            ShaderStageFlags::COMPUTE,
        )
    }

    pub fn sampled_image(self, set: u32, binding: u32, name: &str) -> Self {
        self.binding(
            set,
            binding,
            name,
            DescriptorType::CombinedImageSampler,
            ShaderStageFlags::FRAGMENT,
        )
    }

    pub fn push_constant(mut self, name: &str, size: u32, stages: ShaderStageFlags) -> Self {
        self.reflection.push_constants.push(PushConstantRange {
            id: name.into(),
            stages,
            offset: 0,
            size,
        });
        self
    }

    pub fn build(self) -> ShaderReflection {
        self.reflection
    }
}

/// Maps a PPE-style normalized screen coordinate to a texel index the way
/// the original drawing tests do.
pub fn texel_at(normalized: f32, extent: u32) -> u32 {
    ((normalized + 1.0) * 0.5 * extent as f32 + 0.5).round() as u32
}

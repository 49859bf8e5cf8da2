//! Pipeline descriptions, fixed-function state and shader reflection.
//!
//! Every state struct is `Eq + Hash`: together with the shader fingerprints
//! and the render-pass compatibility key they form the content key under
//! which device pipelines are interned (floats go through `NotNan`).

pub mod cache;
pub mod resources;

use crate::driver::ShaderSource;
use crate::format::Format;
use crate::names::{PushConstantId, UniformId, VertexId};
use bitflags::bitflags;
use ordered_float::NotNan;
use std::fmt;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessControl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
    Task,
    Mesh,
    RayGen,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
}

bitflags! {
    #[derive(Default)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const TESS_CONTROL = 1 << 1;
        const TESS_EVAL = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
        const TASK = 1 << 6;
        const MESH = 1 << 7;
        const RAY_GEN = 1 << 8;
        const MISS = 1 << 9;
        const CLOSEST_HIT = 1 << 10;
        const ANY_HIT = 1 << 11;
        const INTERSECTION = 1 << 12;
        const CALLABLE = 1 << 13;
        const ALL_GRAPHICS = Self::VERTEX.bits
            | Self::TESS_CONTROL.bits
            | Self::TESS_EVAL.bits
            | Self::GEOMETRY.bits
            | Self::FRAGMENT.bits
            | Self::TASK.bits
            | Self::MESH.bits;
        const ALL_RAY_TRACING = Self::RAY_GEN.bits
            | Self::MISS.bits
            | Self::CLOSEST_HIT.bits
            | Self::ANY_HIT.bits
            | Self::INTERSECTION.bits
            | Self::CALLABLE.bits;
    }
}

impl From<ShaderStage> for ShaderStageFlags {
    fn from(stage: ShaderStage) -> ShaderStageFlags {
        match stage {
            ShaderStage::Vertex => ShaderStageFlags::VERTEX,
            ShaderStage::TessControl => ShaderStageFlags::TESS_CONTROL,
            ShaderStage::TessEval => ShaderStageFlags::TESS_EVAL,
            ShaderStage::Geometry => ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => ShaderStageFlags::COMPUTE,
            ShaderStage::Task => ShaderStageFlags::TASK,
            ShaderStage::Mesh => ShaderStageFlags::MESH,
            ShaderStage::RayGen => ShaderStageFlags::RAY_GEN,
            ShaderStage::Miss => ShaderStageFlags::MISS,
            ShaderStage::ClosestHit => ShaderStageFlags::CLOSEST_HIT,
            ShaderStage::AnyHit => ShaderStageFlags::ANY_HIT,
            ShaderStage::Intersection => ShaderStageFlags::INTERSECTION,
            ShaderStage::Callable => ShaderStageFlags::CALLABLE,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DescriptorType {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    InputAttachment,
    AccelerationStructure,
}

// ---------------------------------------------------------------------------
// Reflection

/// One resource binding reported by shader reflection.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub uniform: UniformId,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: ShaderStageFlags,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PushConstantRange {
    pub id: PushConstantId,
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ReflectedVertexInput {
    pub id: VertexId,
    pub location: u32,
    pub format: Format,
}

/// Reflection record returned by the external shader compiler.
#[derive(Clone, Debug, Default)]
pub struct ShaderReflection {
    pub bindings: Vec<ReflectedBinding>,
    pub push_constants: Vec<PushConstantRange>,
    pub vertex_inputs: Vec<ReflectedVertexInput>,
    /// Compute/task local workgroup size.
    pub local_size: [u32; 3],
    /// Descriptor-set names as declared in the source, by set index.
    pub set_names: Vec<(u32, crate::names::DescriptorSetId)>,
}

// ---------------------------------------------------------------------------
// Fixed-function state

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct InputAssemblyState {
    pub topology: PrimitiveTopology,
    pub primitive_restart_enable: bool,
}

impl Default for InputAssemblyState {
    fn default() -> Self {
        InputAssemblyState {
            topology: PrimitiveTopology::TriangleList,
            primitive_restart_enable: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
}

bitflags! {
    #[derive(Default)]
    pub struct CullModeFlags: u32 {
        const NONE = 0;
        const FRONT = 1;
        const BACK = 2;
        const FRONT_AND_BACK = Self::FRONT.bits | Self::BACK.bits;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RasterizationState {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullModeFlags,
    pub front_face: FrontFace,
    pub depth_clamp_enable: bool,
    pub rasterizer_discard_enable: bool,
    pub line_width: NotNan<f32>,
}

impl Default for RasterizationState {
    fn default() -> Self {
        RasterizationState {
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullModeFlags::NONE,
            front_face: FrontFace::CounterClockwise,
            depth_clamp_enable: false,
            rasterizer_discard_enable: false,
            line_width: 1.0.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        DepthStencilState {
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare_op: CompareOp::Less,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags! {
    pub struct ColorComponentFlags: u32 {
        const R = 1;
        const G = 2;
        const B = 4;
        const A = 8;
        const ALL = Self::R.bits | Self::G.bits | Self::B.bits | Self::A.bits;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ColorBlendAttachmentState {
    Disabled,
    Enabled {
        src_color_blend_factor: BlendFactor,
        dst_color_blend_factor: BlendFactor,
        color_blend_op: BlendOp,
        src_alpha_blend_factor: BlendFactor,
        dst_alpha_blend_factor: BlendFactor,
        alpha_blend_op: BlendOp,
        color_write_mask: ColorComponentFlags,
    },
}

impl ColorBlendAttachmentState {
    pub const ALPHA_BLENDING: ColorBlendAttachmentState = ColorBlendAttachmentState::Enabled {
        color_blend_op: BlendOp::Add,
        src_color_blend_factor: BlendFactor::SrcAlpha,
        dst_color_blend_factor: BlendFactor::OneMinusSrcAlpha,
        alpha_blend_op: BlendOp::Add,
        src_alpha_blend_factor: BlendFactor::SrcAlpha,
        dst_alpha_blend_factor: BlendFactor::OneMinusSrcAlpha,
        color_write_mask: ColorComponentFlags::ALL,
    };
}

impl Default for ColorBlendAttachmentState {
    fn default() -> Self {
        ColorBlendAttachmentState::Disabled
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct ColorBlendState {
    pub attachments: Vec<ColorBlendAttachmentState>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum VertexInputRate {
    Vertex,
    Instance,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VertexInputAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct VertexInputState {
    pub bindings: Vec<VertexInputBinding>,
    pub attributes: Vec<VertexInputAttribute>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Viewport {
    pub x: NotNan<f32>,
    pub y: NotNan<f32>,
    pub width: NotNan<f32>,
    pub height: NotNan<f32>,
    pub min_depth: NotNan<f32>,
    pub max_depth: NotNan<f32>,
}

impl From<(u32, u32)> for Viewport {
    fn from((w, h): (u32, u32)) -> Self {
        Viewport {
            x: 0.0.into(),
            y: 0.0.into(),
            width: (w as f32).into(),
            height: (h as f32).into(),
            min_depth: 0.0.into(),
            max_depth: 1.0.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for ScissorRect {
    fn from((w, h): (u32, u32)) -> Self {
        ScissorRect {
            x: 0,
            y: 0,
            width: w,
            height: h,
        }
    }
}

/// Fixed-function state vector of a graphics/mesh pipeline, kept on the
/// pipeline record and hashed into the variant key together with the
/// render-pass compatibility.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct GraphicsState {
    pub input_assembly: InputAssemblyState,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub color_blend: ColorBlendState,
    pub vertex_input: VertexInputState,
}

// ---------------------------------------------------------------------------
// Pipeline descriptors (client-facing)

/// One shader stage of a pipeline descriptor, before compilation.
#[derive(Clone)]
pub struct ShaderStageDesc {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub source: ShaderSource,
    pub debug_name: Option<String>,
}

impl fmt::Debug for ShaderStageDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderStageDesc")
            .field("stage", &self.stage)
            .field("entry_point", &self.entry_point)
            .field("debug_name", &self.debug_name)
            .finish()
    }
}

/// Graphics pipeline descriptor with fluent setters.
#[derive(Clone, Debug, Default)]
pub struct GraphicsPipelineDesc {
    pub shaders: Vec<ShaderStageDesc>,
    pub input_assembly: InputAssemblyState,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub color_blend: ColorBlendState,
    pub vertex_input: VertexInputState,
}

impl GraphicsPipelineDesc {
    pub fn new() -> GraphicsPipelineDesc {
        Default::default()
    }

    pub fn add_shader(
        mut self,
        stage: ShaderStage,
        entry_point: &str,
        source: ShaderSource,
    ) -> Self {
        self.shaders.push(ShaderStageDesc {
            stage,
            entry_point: entry_point.to_owned(),
            source,
            debug_name: None,
        });
        self
    }

    pub fn shader_name(mut self, name: &str) -> Self {
        if let Some(last) = self.shaders.last_mut() {
            last.debug_name = Some(name.to_owned());
        }
        self
    }

    pub fn topology(mut self, topology: PrimitiveTopology) -> Self {
        self.input_assembly.topology = topology;
        self
    }

    pub fn rasterization(mut self, state: RasterizationState) -> Self {
        self.rasterization = state;
        self
    }

    pub fn depth_stencil(mut self, state: DepthStencilState) -> Self {
        self.depth_stencil = state;
        self
    }

    pub fn color_blend(mut self, state: ColorBlendState) -> Self {
        self.color_blend = state;
        self
    }

    pub fn vertex_input(mut self, state: VertexInputState) -> Self {
        self.vertex_input = state;
        self
    }

    pub fn has_mesh_stages(&self) -> bool {
        self.shaders
            .iter()
            .any(|s| s.stage == ShaderStage::Mesh || s.stage == ShaderStage::Task)
    }
}

/// Compute pipeline descriptor.
#[derive(Clone, Debug, Default)]
pub struct ComputePipelineDesc {
    pub shader: Option<ShaderStageDesc>,
}

impl ComputePipelineDesc {
    pub fn new() -> ComputePipelineDesc {
        Default::default()
    }

    pub fn shader(mut self, entry_point: &str, source: ShaderSource) -> Self {
        self.shader = Some(ShaderStageDesc {
            stage: ShaderStage::Compute,
            entry_point: entry_point.to_owned(),
            source,
            debug_name: None,
        });
        self
    }

    pub fn shader_name(mut self, name: &str) -> Self {
        if let Some(shader) = self.shader.as_mut() {
            shader.debug_name = Some(name.to_owned());
        }
        self
    }
}

/// Mesh pipeline descriptor (task/mesh/fragment stages).
#[derive(Clone, Debug, Default)]
pub struct MeshPipelineDesc {
    pub shaders: Vec<ShaderStageDesc>,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub color_blend: ColorBlendState,
}

impl MeshPipelineDesc {
    pub fn new() -> MeshPipelineDesc {
        Default::default()
    }

    pub fn add_shader(
        mut self,
        stage: ShaderStage,
        entry_point: &str,
        source: ShaderSource,
    ) -> Self {
        self.shaders.push(ShaderStageDesc {
            stage,
            entry_point: entry_point.to_owned(),
            source,
            debug_name: None,
        });
        self
    }
}

/// Ray-tracing pipeline descriptor.
#[derive(Clone, Debug, Default)]
pub struct RayTracingPipelineDesc {
    pub shaders: Vec<ShaderStageDesc>,
    pub max_recursion_depth: u32,
}

impl RayTracingPipelineDesc {
    pub fn new() -> RayTracingPipelineDesc {
        Default::default()
    }

    pub fn add_shader(
        mut self,
        stage: ShaderStage,
        entry_point: &str,
        source: ShaderSource,
    ) -> Self {
        self.shaders.push(ShaderStageDesc {
            stage,
            entry_point: entry_point.to_owned(),
            source,
            debug_name: None,
        });
        self
    }
}

//! Sampler descriptions.

use ordered_float::NotNan;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SamplerMipmapMode {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

/// Sampler descriptor. Samplers are content-addressed: two descriptors
/// comparing equal always intern to the same handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SamplerDesc {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mipmap_mode: SamplerMipmapMode,
    pub address_u: SamplerAddressMode,
    pub address_v: SamplerAddressMode,
    pub address_w: SamplerAddressMode,
    pub mip_lod_bias: NotNan<f32>,
    pub min_lod: NotNan<f32>,
    pub max_lod: NotNan<f32>,
    pub anisotropy: Option<NotNan<f32>>,
}

impl SamplerDesc {
    /// Trilinear filtering, repeat addressing.
    pub fn linear() -> SamplerDesc {
        SamplerDesc {
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mipmap_mode: SamplerMipmapMode::Linear,
            address_u: SamplerAddressMode::Repeat,
            address_v: SamplerAddressMode::Repeat,
            address_w: SamplerAddressMode::Repeat,
            mip_lod_bias: 0.0.into(),
            min_lod: 0.0.into(),
            max_lod: 1000.0.into(),
            anisotropy: None,
        }
    }

    /// Point sampling of level 0, clamped addressing.
    pub fn nearest() -> SamplerDesc {
        SamplerDesc {
            min_filter: Filter::Nearest,
            mag_filter: Filter::Nearest,
            mipmap_mode: SamplerMipmapMode::Nearest,
            address_u: SamplerAddressMode::ClampToEdge,
            address_v: SamplerAddressMode::ClampToEdge,
            address_w: SamplerAddressMode::ClampToEdge,
            mip_lod_bias: 0.0.into(),
            min_lod: 0.0.into(),
            max_lod: 0.0.into(),
            anisotropy: None,
        }
    }
}

impl Default for SamplerDesc {
    fn default() -> Self {
        SamplerDesc::linear()
    }
}

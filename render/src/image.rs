//! Image descriptions, subresources and read-back views.

use crate::format::{Format, FormatAspect};
use bitflags::bitflags;

/// Dimensions of an image.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Dimensions {
    /// 1D image
    Dim1d { width: u32 },
    /// 2D image
    Dim2d { width: u32, height: u32 },
    /// Array of 2D images
    Dim2dArray {
        width: u32,
        height: u32,
        array_layers: u32,
    },
    /// 3D image
    Dim3d { width: u32, height: u32, depth: u32 },
}

impl Dimensions {
    #[inline]
    pub fn width(&self) -> u32 {
        match *self {
            Dimensions::Dim1d { width } => width,
            Dimensions::Dim2d { width, .. } => width,
            Dimensions::Dim2dArray { width, .. } => width,
            Dimensions::Dim3d { width, .. } => width,
        }
    }

    /// Returns 1 for 1D images.
    #[inline]
    pub fn height(&self) -> u32 {
        match *self {
            Dimensions::Dim1d { .. } => 1,
            Dimensions::Dim2d { height, .. } => height,
            Dimensions::Dim2dArray { height, .. } => height,
            Dimensions::Dim3d { height, .. } => height,
        }
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        match *self {
            Dimensions::Dim3d { depth, .. } => depth,
            _ => 1,
        }
    }

    #[inline]
    pub fn array_layers(&self) -> u32 {
        match *self {
            Dimensions::Dim2dArray { array_layers, .. } => array_layers,
            _ => 1,
        }
    }

    /// Texel count of mip level 0 across all layers.
    pub fn texel_count(&self) -> u64 {
        u64::from(self.width())
            * u64::from(self.height())
            * u64::from(self.depth())
            * u64::from(self.array_layers())
    }
}

impl From<(u32, u32)> for Dimensions {
    fn from((width, height): (u32, u32)) -> Dimensions {
        Dimensions::Dim2d { width, height }
    }
}

bitflags! {
    /// Declared usages of an image; the driver validates actual use against
    /// these.
    #[derive(Default)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        const INPUT_ATTACHMENT = 1 << 6;
    }
}

/// A mip level index.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct MipmapLevel(pub u32);

/// An array layer index.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ImageLayer(pub u32);

/// Sample count per texel. Always a power of two.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MultiSamples(pub u32);

impl Default for MultiSamples {
    fn default() -> Self {
        MultiSamples(1)
    }
}

/// Creation descriptor for an image.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageDesc {
    pub dimensions: Dimensions,
    pub format: Format,
    pub usage: ImageUsage,
    pub levels: u32,
    pub samples: MultiSamples,
}

impl Default for ImageDesc {
    fn default() -> Self {
        ImageDesc {
            dimensions: Dimensions::Dim2d {
                width: 1,
                height: 1,
            },
            format: Format::R8G8B8A8_UNORM,
            usage: ImageUsage::empty(),
            levels: 1,
            samples: MultiSamples(1),
        }
    }
}

impl ImageDesc {
    pub fn new() -> ImageDesc {
        Default::default()
    }

    pub fn dimensions(mut self, dimensions: impl Into<Dimensions>) -> Self {
        self.dimensions = dimensions.into();
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn usage(mut self, usage: ImageUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn levels(mut self, levels: u32) -> Self {
        self.levels = levels;
        self
    }

    pub fn samples(mut self, samples: u32) -> Self {
        self.samples = MultiSamples(samples);
        self
    }

    /// Tight byte size of level 0 (no row padding).
    pub fn byte_size(&self) -> u64 {
        self.dimensions.texel_count() * u64::from(self.format.texel_size())
    }
}

/// Range of subresources touched by an access or barrier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageSubresourceRange {
    pub aspect: FormatAspect,
    pub base_level: MipmapLevel,
    pub level_count: u32,
    pub base_layer: ImageLayer,
    pub layer_count: u32,
}

impl ImageSubresourceRange {
    pub fn whole(desc: &ImageDesc) -> ImageSubresourceRange {
        ImageSubresourceRange {
            aspect: desc.format.aspect(),
            base_level: MipmapLevel(0),
            level_count: desc.levels,
            base_layer: ImageLayer(0),
            layer_count: desc.dimensions.array_layers(),
        }
    }

    pub fn overlaps(&self, other: &ImageSubresourceRange) -> bool {
        let levels = self.base_level.0 < other.base_level.0 + other.level_count
            && other.base_level.0 < self.base_level.0 + self.level_count;
        let layers = self.base_layer.0 < other.base_layer.0 + other.layer_count
            && other.base_layer.0 < self.base_layer.0 + self.layer_count;
        levels && layers
    }
}

impl Default for ImageSubresourceRange {
    fn default() -> Self {
        ImageSubresourceRange {
            aspect: FormatAspect::Color,
            base_level: MipmapLevel(0),
            level_count: 1,
            base_layer: ImageLayer(0),
            layer_count: 1,
        }
    }
}

/// One mip level + layer slice, as used by copy regions.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ImageSubresourceLayers {
    pub level: MipmapLevel,
    pub base_layer: ImageLayer,
    pub layer_count: u32,
}

/// Read-only view over downloaded image bytes, handed to read-back
/// callbacks. The view borrows staging memory and dies with the callback.
pub struct ImageView<'a> {
    dimensions: Dimensions,
    format: Format,
    row_pitch: usize,
    bytes: &'a [u8],
}

impl<'a> ImageView<'a> {
    pub fn new(
        dimensions: Dimensions,
        format: Format,
        row_pitch: usize,
        bytes: &'a [u8],
    ) -> ImageView<'a> {
        ImageView {
            dimensions,
            format,
            row_pitch,
            bytes,
        }
    }

    /// The empty view delivered with `Aborted`/`DeviceLost` status.
    pub fn empty() -> ImageView<'static> {
        ImageView {
            dimensions: Dimensions::Dim2d {
                width: 0,
                height: 0,
            },
            format: Format::R8G8B8A8_UNORM,
            row_pitch: 0,
            bytes: &[],
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw bytes of the texel at `(x, y, z)`.
    pub fn texel_bytes(&self, x: u32, y: u32, z: u32) -> &[u8] {
        let texel = self.format.texel_size() as usize;
        let slice_pitch = self.row_pitch * self.dimensions.height() as usize;
        let off = z as usize * slice_pitch + y as usize * self.row_pitch + x as usize * texel;
        &self.bytes[off..off + texel]
    }

    /// Decodes the texel at `(x, y, z)` into RGBA floats. Panics if the
    /// coordinate is out of bounds; returns `None` for undecodable formats.
    pub fn load(&self, x: u32, y: u32, z: u32) -> Option<[f32; 4]> {
        assert!(x < self.dimensions.width() && y < self.dimensions.height());
        self.format.decode(self.texel_bytes(x, y, z))
    }

    /// Decodes the texel at `(x, y, z)` as four unsigned byte channels
    /// (for 8-bit unorm formats: the raw channel values 0..=255).
    pub fn load_u8(&self, x: u32, y: u32, z: u32) -> Option<[u32; 4]> {
        self.load(x, y, z).map(|t| {
            let mut out = [0u32; 4];
            for (i, channel) in t.iter().enumerate() {
                out[i] = (channel * 255.0 + 0.5) as u32;
            }
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_view_addressing() {
        // 4x2 RGBA8 with an 18-byte row pitch (2 bytes of padding per row).
        let mut bytes = vec![0u8; 18 * 2];
        bytes[18 + 2 * 4] = 0xff; // texel (2, 1), red channel
        let view = ImageView::new(
            Dimensions::Dim2d {
                width: 4,
                height: 2,
            },
            Format::R8G8B8A8_UNORM,
            18,
            &bytes,
        );
        assert_eq!(view.load_u8(2, 1, 0).unwrap(), [255, 0, 0, 0]);
        assert_eq!(view.load_u8(1, 1, 0).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn subrange_overlap() {
        let a = ImageSubresourceRange {
            base_level: MipmapLevel(0),
            level_count: 2,
            ..Default::default()
        };
        let b = ImageSubresourceRange {
            base_level: MipmapLevel(1),
            level_count: 1,
            ..Default::default()
        };
        let c = ImageSubresourceRange {
            base_level: MipmapLevel(2),
            level_count: 1,
            ..Default::default()
        };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}

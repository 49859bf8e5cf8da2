//! Buffer descriptions and read-back views.

use bitflags::bitflags;
use smallvec::SmallVec;

bitflags! {
    #[derive(Default)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const INDIRECT = 1 << 6;
        const UNIFORM_TEXEL = 1 << 7;
        const STORAGE_TEXEL = 1 << 8;
    }
}

/// Creation descriptor for a buffer.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDesc {
    pub fn new(size: u64, usage: BufferUsage) -> BufferDesc {
        BufferDesc { size, usage }
    }
}

/// A sub-range view of a buffer used by bindings (uniform/storage offsets).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BufferRange {
    pub offset: u64,
    pub size: u64,
}

/// Read-only view over downloaded buffer bytes.
///
/// Downloads that cross staging-chunk boundaries arrive in multiple parts;
/// `parts()` exposes them in order without copying.
pub struct BufferView<'a> {
    parts: SmallVec<[&'a [u8]; 2]>,
}

impl<'a> BufferView<'a> {
    pub fn new(parts: impl IntoIterator<Item = &'a [u8]>) -> BufferView<'a> {
        BufferView {
            parts: parts.into_iter().collect(),
        }
    }

    /// The empty view delivered with `Aborted`/`DeviceLost` status.
    pub fn empty() -> BufferView<'static> {
        BufferView {
            parts: SmallVec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.parts.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn parts(&self) -> &[&'a [u8]] {
        &self.parts
    }

    /// Copies the view into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for p in &self.parts {
            out.extend_from_slice(p);
        }
        out
    }

    /// Reinterprets a single-part view as little-endian `f32`s.
    /// Panics if the view is fragmented or misaligned in length.
    pub fn as_f32(&self) -> Vec<f32> {
        assert_eq!(self.parts.len(), 1, "fragmented buffer view");
        let bytes = self.parts[0];
        assert_eq!(bytes.len() % 4, 0);
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_bits(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_part_view() {
        let a = [1u8, 2];
        let b = [3u8];
        let view = BufferView::new(vec![&a[..], &b[..]]);
        assert_eq!(view.size(), 3);
        assert_eq!(view.parts().len(), 2);
        assert_eq!(view.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn f32_reinterpretation() {
        let bytes = 1.5f32.to_bits().to_le_bytes();
        let view = BufferView::new(Some(&bytes[..]));
        assert_eq!(view.as_f32(), vec![1.5]);
    }
}

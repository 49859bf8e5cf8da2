//! Bump allocator for per-frame transient resources.

use crate::util::align_up;

/// Linear allocator over one fixed-size range.
///
/// Allocation is a bump of the head pointer; individual frees do not exist.
/// The owning frame calls [`reset`] once its fence signals, reclaiming the
/// whole range at once.
///
/// [`reset`]: LinearAllocator::reset
#[derive(Debug)]
pub struct LinearAllocator {
    capacity: u64,
    head: u64,
    high_water: u64,
}

impl LinearAllocator {
    pub fn new(capacity: u64) -> LinearAllocator {
        LinearAllocator {
            capacity,
            head: 0,
            high_water: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.head
    }

    /// Peak usage since creation, for diagnostics.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Returns the offset of the allocated range, or `None` when the
    /// remaining space cannot fit it.
    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let offset = align_up(self.head, align);
        let end = offset.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.head = end;
        self.high_water = self.high_water.max(end);
        Some(offset)
    }

    pub fn reset(&mut self) {
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_reset() {
        let mut a = LinearAllocator::new(100);
        assert_eq!(a.allocate(10, 1), Some(0));
        assert_eq!(a.allocate(10, 16), Some(16));
        assert_eq!(a.used(), 26);
        assert_eq!(a.allocate(80, 1), None);
        a.reset();
        assert_eq!(a.allocate(80, 1), Some(0));
        assert_eq!(a.high_water(), 80);
    }
}

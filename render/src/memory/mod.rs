//! Device-memory sub-allocation.
//!
//! Two allocators cover the two resource lifetimes: a buddy-style
//! [`SlabAllocator`] for long-lived resources, and a bump [`LinearAllocator`]
//! reset wholesale for per-frame transients.

mod linear;
mod slab;

pub use self::linear::LinearAllocator;
pub use self::slab::SlabAllocator;

use crate::driver::DeviceMemory;

/// Kind of memory backing an allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryType {
    DeviceLocal,
    HostUpload,
    HostReadback,
}

/// A sub-allocated range of one device heap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryBlock {
    pub heap: DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub memory_type: MemoryType,
}

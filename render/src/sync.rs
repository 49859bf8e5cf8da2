//! Pipeline stages, access masks, image layouts and barrier descriptions.
//!
//! These mirror the explicit synchronization model of a Vulkan-like driver:
//! every dependency between two tasks is expressed as a half-barrier pair
//! `(stage mask, access mask, layout)` on each side.

use crate::handle::{BufferId, ImageId};
use crate::image::ImageSubresourceRange;
use bitflags::bitflags;

bitflags! {
    /// Pipeline stages, in rough pipeline order.
    #[derive(Default)]
    pub struct StageFlags: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const TESS_CONTROL_SHADER = 1 << 4;
        const TESS_EVAL_SHADER = 1 << 5;
        const GEOMETRY_SHADER = 1 << 6;
        const TASK_SHADER = 1 << 7;
        const MESH_SHADER = 1 << 8;
        const FRAGMENT_SHADER = 1 << 9;
        const EARLY_FRAGMENT_TESTS = 1 << 10;
        const LATE_FRAGMENT_TESTS = 1 << 11;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 12;
        const COMPUTE_SHADER = 1 << 13;
        const TRANSFER = 1 << 14;
        const RAY_TRACING_SHADER = 1 << 15;
        const ACCELERATION_STRUCTURE_BUILD = 1 << 16;
        const BOTTOM_OF_PIPE = 1 << 17;
        const HOST = 1 << 18;
        const ALL_GRAPHICS = Self::DRAW_INDIRECT.bits
            | Self::VERTEX_INPUT.bits
            | Self::VERTEX_SHADER.bits
            | Self::TESS_CONTROL_SHADER.bits
            | Self::TESS_EVAL_SHADER.bits
            | Self::GEOMETRY_SHADER.bits
            | Self::TASK_SHADER.bits
            | Self::MESH_SHADER.bits
            | Self::FRAGMENT_SHADER.bits
            | Self::EARLY_FRAGMENT_TESTS.bits
            | Self::LATE_FRAGMENT_TESTS.bits
            | Self::COLOR_ATTACHMENT_OUTPUT.bits;
        const ALL_COMMANDS = 0x7ffff;
    }
}

bitflags! {
    /// Memory access kinds participating in barriers.
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const INDEX_READ = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const UNIFORM_READ = 1 << 3;
        const INPUT_ATTACHMENT_READ = 1 << 4;
        const SHADER_READ = 1 << 5;
        const SHADER_WRITE = 1 << 6;
        const COLOR_ATTACHMENT_READ = 1 << 7;
        const COLOR_ATTACHMENT_WRITE = 1 << 8;
        const DEPTH_STENCIL_ATTACHMENT_READ = 1 << 9;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 10;
        const TRANSFER_READ = 1 << 11;
        const TRANSFER_WRITE = 1 << 12;
        const HOST_READ = 1 << 13;
        const HOST_WRITE = 1 << 14;
        const MEMORY_READ = 1 << 15;
        const MEMORY_WRITE = 1 << 16;
        const ACCELERATION_STRUCTURE_READ = 1 << 17;
        const ACCELERATION_STRUCTURE_WRITE = 1 << 18;
    }
}

/// Returns true if the mask contains any write access.
pub fn is_write_access(mask: AccessFlags) -> bool {
    mask.intersects(
        AccessFlags::SHADER_WRITE
            | AccessFlags::COLOR_ATTACHMENT_WRITE
            | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            | AccessFlags::TRANSFER_WRITE
            | AccessFlags::HOST_WRITE
            | AccessFlags::MEMORY_WRITE
            | AccessFlags::ACCELERATION_STRUCTURE_WRITE,
    )
}

/// Returns true if the mask contains any read access.
pub fn is_read_access(mask: AccessFlags) -> bool {
    mask.intersects(
        AccessFlags::INDIRECT_COMMAND_READ
            | AccessFlags::INDEX_READ
            | AccessFlags::VERTEX_ATTRIBUTE_READ
            | AccessFlags::UNIFORM_READ
            | AccessFlags::INPUT_ATTACHMENT_READ
            | AccessFlags::SHADER_READ
            | AccessFlags::COLOR_ATTACHMENT_READ
            | AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | AccessFlags::TRANSFER_READ
            | AccessFlags::HOST_READ
            | AccessFlags::MEMORY_READ
            | AccessFlags::ACCELERATION_STRUCTURE_READ,
    )
}

/// Explicit image layouts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

impl Default for ImageLayout {
    fn default() -> Self {
        ImageLayout::Undefined
    }
}

/// Logical device queues. The driver maps these to hardware queue families.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QueueKind {
    Graphics,
    AsyncCompute,
    Transfer,
}

impl Default for QueueKind {
    fn default() -> Self {
        QueueKind::Graphics
    }
}

/// One side of a dependency: the stages and accesses that must complete
/// (source) or that wait (destination), plus the image layout on that side.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BarrierHalf {
    pub stage_mask: StageFlags,
    pub access_mask: AccessFlags,
    pub layout: ImageLayout,
}

/// Global memory barrier, not tied to a particular resource.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemoryBarrier {
    pub src_access_mask: AccessFlags,
    pub dst_access_mask: AccessFlags,
}

/// Barrier on a buffer range. Queue indices differ only for ownership
/// transfers.
#[derive(Clone, Debug)]
pub struct BufferBarrier {
    pub id: BufferId,
    pub src_access_mask: AccessFlags,
    pub dst_access_mask: AccessFlags,
    pub src_queue: QueueKind,
    pub dst_queue: QueueKind,
    pub offset: u64,
    pub size: u64,
}

/// Barrier on an image subresource range, optionally transitioning its
/// layout and/or queue ownership.
#[derive(Clone, Debug)]
pub struct ImageBarrier {
    pub id: ImageId,
    pub src_access_mask: AccessFlags,
    pub dst_access_mask: AccessFlags,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_queue: QueueKind,
    pub dst_queue: QueueKind,
    pub range: ImageSubresourceRange,
}

/// A fully resolved pipeline barrier as emitted by the task processor.
///
/// Consecutive barriers with the same `(src_stage_mask, dst_stage_mask)` are
/// merged into one of these.
#[derive(Clone, Debug, Default)]
pub struct PipelineBarrier {
    pub src_stage_mask: StageFlags,
    pub dst_stage_mask: StageFlags,
    pub memory: Vec<MemoryBarrier>,
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
}

impl PipelineBarrier {
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffers.is_empty() && self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_classification() {
        assert!(is_write_access(AccessFlags::SHADER_WRITE));
        assert!(is_write_access(
            AccessFlags::SHADER_READ | AccessFlags::TRANSFER_WRITE
        ));
        assert!(!is_write_access(AccessFlags::SHADER_READ));
        assert!(is_read_access(AccessFlags::UNIFORM_READ));
        assert!(!is_read_access(AccessFlags::TRANSFER_WRITE));
    }
}

//! Scoped resource guard.

use crate::graph::FrameGraph;
use crate::handle::{Id, ResourceTag};
use std::ops::Deref;

/// Releases the held handle when dropped; `release()` forfeits the guard
/// without decrementing.
///
/// ```ignore
/// let image = AutoResource::new(&fg, fg.create_image(&desc, Some("rt"))?);
/// // used as a plain id through Deref
/// cmd.task(ReadImage::new().image(*image, [0; 3], [16, 16]))?;
/// // dropped here: the reference is released
/// ```
pub struct AutoResource<'a, T: ResourceTag> {
    graph: &'a FrameGraph,
    id: Id<T>,
    armed: bool,
}

impl<'a, T: ResourceTag> AutoResource<'a, T> {
    pub fn new(graph: &'a FrameGraph, id: Id<T>) -> AutoResource<'a, T> {
        AutoResource {
            graph,
            id,
            armed: true,
        }
    }

    pub fn valid(&self) -> bool {
        self.id.valid()
    }

    /// Forfeits ownership: the handle is returned and will not be released
    /// by the guard.
    pub fn release(mut self) -> Id<T> {
        self.armed = false;
        self.id
    }

    pub fn get(&self) -> Id<T> {
        self.id
    }
}

impl<'a, T: ResourceTag> Deref for AutoResource<'a, T> {
    type Target = Id<T>;

    fn deref(&self) -> &Id<T> {
        &self.id
    }
}

impl<'a, T: ResourceTag> Drop for AutoResource<'a, T> {
    fn drop(&mut self) {
        if self.armed {
            self.graph.release_resource(self.id);
        }
    }
}

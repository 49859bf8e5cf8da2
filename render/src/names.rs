//! Strongly-typed string identifiers used by the binding model.
//!
//! Uniforms, descriptor sets, push constants, vertex streams and render
//! targets are all addressed by name. Each name kind is its own type so a
//! uniform name cannot be passed where a render-target name is expected.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

macro_rules! name_ids {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
            pub struct $name(Arc<str>);

            impl $name {
                pub fn new(name: impl Into<Arc<str>>) -> $name {
                    $name(name.into())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!(stringify!($name), "({:?})"), &*self.0)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(s: &str) -> $name {
                    $name::new(s)
                }
            }

            impl Borrow<str> for $name {
                fn borrow(&self) -> &str {
                    &self.0
                }
            }
        )*
    };
}

name_ids! {
    /// Name of one shader uniform (image, buffer, sampler, ...).
    UniformId,
    /// Name of one descriptor set as declared in shader reflection.
    DescriptorSetId,
    /// Name of one push-constant block.
    PushConstantId,
    /// Name of one vertex input stream.
    VertexId,
    /// Name of one render target of a logical render pass.
    RenderTargetId,
}

impl RenderTargetId {
    /// Conventional name of color attachment `index`.
    pub fn color(index: u32) -> RenderTargetId {
        RenderTargetId::new(format!("Color{}", index))
    }

    /// Conventional name of the depth-stencil attachment.
    pub fn depth() -> RenderTargetId {
        RenderTargetId::new("Depth")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_types_same_text() {
        let u = UniformId::new("main");
        assert_eq!(u, UniformId::from("main"));
        assert_eq!(u.as_str(), "main");
        assert_eq!(RenderTargetId::color(0).as_str(), "Color0");
    }
}

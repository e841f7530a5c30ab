mod barrier;
mod manager;
mod request;
mod skeleton;
mod tree;

pub use barrier::*;
pub use manager::*;
pub use request::*;
pub use skeleton::*;
pub use tree::*;

/// Index into the tree's GPU-resident node property pool.
pub type NodeHandle = u32;
pub const INVALID_NODE: NodeHandle = !0;

/// 3x4 affine transform of a node relative to its parent.
pub type RelativeTransform = glam::Affine3A;

/// Stamps of a freshly provisioned node: modified strictly after recomputed,
/// so the node is stale and the next recompute pass picks it up.
pub const INITIAL_MODIFIED_STAMP: u32 = 1;
pub const INITIAL_RECOMPUTED_STAMP: u32 = 0;

/// The node properties resident in the tree's GPU pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformProperty {
    Parent,
    RelativeTransform,
    ModifiedStamp,
    RecomputedStamp,
    GlobalTransform,
}

impl TransformProperty {
    pub const COUNT: usize = 5;
    pub const ALL: [TransformProperty; Self::COUNT] = [
        TransformProperty::Parent,
        TransformProperty::RelativeTransform,
        TransformProperty::ModifiedStamp,
        TransformProperty::RecomputedStamp,
        TransformProperty::GlobalTransform,
    ];

    /// Byte size of one element in the property's array.
    pub fn stride(self) -> u32 {
        match self {
            TransformProperty::Parent => std::mem::size_of::<NodeHandle>() as u32,
            TransformProperty::RelativeTransform | TransformProperty::GlobalTransform => 48,
            TransformProperty::ModifiedStamp | TransformProperty::RecomputedStamp => {
                std::mem::size_of::<u32>() as u32
            }
        }
    }

    /// Binding index within the tree's property descriptor set.
    pub fn binding(self) -> u32 {
        match self {
            TransformProperty::Parent => 0,
            TransformProperty::RelativeTransform => 1,
            TransformProperty::ModifiedStamp => 2,
            TransformProperty::RecomputedStamp => 3,
            TransformProperty::GlobalTransform => 4,
        }
    }
}

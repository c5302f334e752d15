use core::fmt::Debug;
use core::hash::Hash;

/// Anything that sits in a block tree: it has an identity of its own and
/// names the identity of its parent.
///
/// Two values with the same identifier are treated as the same block.
pub trait Identified {
    /// Identifier type, usually a digest.
    type Identifier: Clone + Eq + Hash + Debug;

    /// Identity of this block.
    fn id(&self) -> Self::Identifier;
    /// Identity of the parent, `None` for a root (genesis) block.
    fn parent_id(&self) -> Option<Self::Identifier>;
}

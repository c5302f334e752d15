use crate::Identified;

/// Fork tree.
///
/// A fork tree tracks blocks of forks. However, it does not track the best
/// block. Instead, that is supposed to be handled by the `Chain` directly,
/// which also owns the fork choice rule.
pub trait ForkTree {
    /// The type of the identified. It can be a block or a header.
    type Block: Identified;
    /// Query error type.
    type QueryError;

    /// Whether the block is part of the tree.
    fn contains(&self, id: &<Self::Block as Identified>::Identifier) -> bool;

    /// Get a block by its id.
    fn block(
        &self,
        id: &<Self::Block as Identified>::Identifier,
    ) -> Result<&Self::Block, Self::QueryError>;

    /// Get a block depth by its id.
    fn block_depth(
        &self,
        id: &<Self::Block as Identified>::Identifier,
    ) -> Result<usize, Self::QueryError>;

    /// Find an ancestor block at given depth.
    ///
    /// If ancestor depth equals the provided block's depth, return the provided block ID.
    fn ancestor_id_at_depth(
        &self,
        id: &<Self::Block as Identified>::Identifier,
        ancestor_depth: usize,
    ) -> Result<<Self::Block as Identified>::Identifier, Self::QueryError>;

    /// Whether is ancestor.
    ///
    /// If ancestor depth equals the provided block's depth, return true.
    fn is_ancestor(
        &self,
        id: &<Self::Block as Identified>::Identifier,
        ancestor_id: &<Self::Block as Identified>::Identifier,
    ) -> Result<bool, Self::QueryError> {
        let ancestor_depth = self.block_depth(ancestor_id)?;
        if ancestor_depth > self.block_depth(id)? {
            return Ok(false);
        }

        Ok(self.ancestor_id_at_depth(id, ancestor_depth)? == *ancestor_id)
    }
}

/// A structure representing a chain with possible forks.
pub trait ForkTreeMut: ForkTree {
    /// Insert error type.
    type InsertError;

    /// Insert a new block. Its parent must already be in the tree, unless it
    /// is a genesis.
    fn insert(&mut self, block: Self::Block) -> Result<(), Self::InsertError>;
}

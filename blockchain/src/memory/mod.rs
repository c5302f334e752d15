//! Memory-only implementations.

mod store;

pub use self::store::MemoryStore;

use itertools::Itertools;
use std::collections::HashMap;
use thiserror::Error;

use crate::{ForkTree, ForkTreeMut, Identified};

#[derive(Clone, Debug)]
struct MemoryForkTreeItem<Block: Identified> {
    block: Block,
    depth: usize,
    ancestors: Vec<(usize, Block::Identifier)>,
}

/// A fork tree that resides entirely in memory.
#[derive(Clone, Debug)]
pub struct MemoryForkTree<Block: Identified> {
    blocks: HashMap<Block::Identifier, MemoryForkTreeItem<Block>>,
}

impl<Block: Identified> MemoryForkTree<Block> {
    /// Create a new fork tree.
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    /// Number of blocks in the tree.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the tree holds no block at all.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl<Block: Identified> Default for MemoryForkTree<Block> {
    fn default() -> Self {
        Self::new()
    }
}

/// Query error for memory fork tree.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum MemoryForkTreeQueryError {
    /// Block is unknown.
    #[error("unknown block")]
    UnknownBlock,
    /// Ancestor depth provided is greater than current block depth.
    #[error("invalid ancestor depth")]
    InvalidAncestorDepth,
}

impl<Block: Identified> ForkTree for MemoryForkTree<Block> {
    type Block = Block;
    type QueryError = MemoryForkTreeQueryError;

    fn contains(&self, id: &Block::Identifier) -> bool {
        self.blocks.contains_key(id)
    }

    fn block(&self, id: &Block::Identifier) -> Result<&Block, Self::QueryError> {
        Ok(&self
            .blocks
            .get(id)
            .ok_or(MemoryForkTreeQueryError::UnknownBlock)?
            .block)
    }

    fn block_depth(&self, id: &Block::Identifier) -> Result<usize, Self::QueryError> {
        Ok(self
            .blocks
            .get(id)
            .ok_or(MemoryForkTreeQueryError::UnknownBlock)?
            .depth)
    }

    fn ancestor_id_at_depth(
        &self,
        id: &Block::Identifier,
        ancestor_depth: usize,
    ) -> Result<Block::Identifier, Self::QueryError> {
        let mut current_block = self
            .blocks
            .get(id)
            .ok_or(MemoryForkTreeQueryError::UnknownBlock)?;

        if current_block.depth < ancestor_depth {
            return Err(MemoryForkTreeQueryError::InvalidAncestorDepth);
        }

        loop {
            if current_block.depth == ancestor_depth {
                return Ok(current_block.block.id());
            }

            let parent_id = current_block
                .block
                .parent_id()
                // If the current block depth is 0, then the ancestor depth
                // provided must be invalid.
                .ok_or(MemoryForkTreeQueryError::InvalidAncestorDepth)?;

            // Jump to the lowest skip ancestor that does not overshoot the
            // target, or fall back to the parent.
            let next_ancestor_id = current_block
                .ancestors
                .iter()
                .filter(|(d, _)| *d >= ancestor_depth)
                .min_by_key(|(d, _)| *d)
                .map(|(_, id)| id.clone())
                .unwrap_or(parent_id);

            current_block = self
                .blocks
                .get(&next_ancestor_id)
                .ok_or(MemoryForkTreeQueryError::UnknownBlock)?;
        }
    }
}

/// Insert error for memory fork tree.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum MemoryForkTreeInsertError {
    /// Parent is unknown.
    #[error("unknown parent")]
    UnknownParent,
    /// Block is already part of the tree.
    #[error("block already in tree")]
    Duplicate,
    /// Encounted a query issue in insertion.
    #[error("query failed during insertion: {0}")]
    Query(#[from] MemoryForkTreeQueryError),
}

/// Skip depths for ancestor list.
const SKIP_DEPTHS: [usize; 16] = [
    4usize.pow(1),
    4usize.pow(2),
    4usize.pow(3),
    4usize.pow(4),
    4usize.pow(5),
    4usize.pow(6),
    4usize.pow(7),
    4usize.pow(8),
    4usize.pow(9),
    4usize.pow(10),
    4usize.pow(11),
    4usize.pow(12),
    4usize.pow(13),
    4usize.pow(14),
    4usize.pow(15),
    4usize.pow(16),
];

impl<Block: Identified> ForkTreeMut for MemoryForkTree<Block> {
    type InsertError = MemoryForkTreeInsertError;

    fn insert(&mut self, block: Block) -> Result<(), Self::InsertError> {
        let block_id = block.id();
        if self.blocks.contains_key(&block_id) {
            return Err(MemoryForkTreeInsertError::Duplicate);
        }

        let (depth, ancestors) = match block.parent_id() {
            Some(parent_id) => {
                let depth = self
                    .blocks
                    .get(&parent_id)
                    .ok_or(MemoryForkTreeInsertError::UnknownParent)?
                    .depth
                    + 1;

                // Build a skip list of ancestors. If the current block depth
                // can be divided by `SKIP_DEPTHS`, then we call
                // `ancestor_id_at_depth` to track back on the ancestor block.
                let ancestor_depths = SKIP_DEPTHS
                    .iter()
                    .filter(|skip_depth| depth >= **skip_depth && depth % **skip_depth == 0)
                    .map(|skip_depth| depth - skip_depth)
                    .unique();

                let mut ancestors = Vec::new();
                for ancestor_depth in ancestor_depths {
                    ancestors.push((
                        ancestor_depth,
                        self.ancestor_id_at_depth(&parent_id, ancestor_depth)?,
                    ));
                }

                (depth, ancestors)
            }
            None => (0, Vec::new()),
        };

        self.blocks.insert(
            block_id,
            MemoryForkTreeItem {
                block,
                depth,
                ancestors,
            },
        );

        Ok(())
    }
}

use blockchain::{ForkTree, Identified};
use std::fmt::Debug;
use thiserror::Error;

use crate::Hash;

/// Reasons a block is refused. Never fatal to the node: the block is dropped
/// and processing continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed block encoding: {0}")]
    Malformed(String),
    #[error("proof of work does not meet target")]
    InvalidProof,
    #[error("height {found} does not follow parent height {parent}")]
    InconsistentHeight { parent: u64, found: u64 },
    #[error("unexpected genesis block")]
    UnexpectedGenesis,
    #[error("expected {expected} related blocks, found {found}")]
    InvalidAncestors { expected: usize, found: usize },
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    Oversized { size: usize, limit: usize },
    #[error("target {found} differs from parent target {expected}")]
    TargetMismatch { expected: Hash, found: Hash },
    #[error("related block at height {height} is not an ancestor")]
    UnrelatedAncestor { height: u64 },
    #[error("inconsistent block: {0}")]
    Inconsistent(String),
}

/// What the node needs from a block type. Encoding, hashing and the proof of
/// work itself belong to the implementation.
pub trait Block: Identified<Identifier = Hash> + Clone + Debug + Send + Sync + 'static {
    /// 0 for genesis, parent height + 1 otherwise.
    fn height(&self) -> u64;

    fn serialize(&self) -> Vec<u8>;

    fn deserialize(bytes: &[u8]) -> Result<Self, ValidationError>;

    /// Hashes of ancestors worth fetching ahead of time.
    fn related_blocks(&self) -> Vec<Hash>;

    fn valid_proof(&self) -> bool;

    fn increment_nonce(&mut self);

    /// Structural checks that need no chain context, proof of work included.
    fn assert_internal_consistency(&self) -> Result<(), ValidationError>;

    /// Checks that depend on the parent, such as the difficulty a child
    /// inherits. `tree` holds `parent` and all of its ancestors.
    fn assert_valid_child<F>(&self, parent: &Self, tree: &F) -> Result<(), ValidationError>
    where
        F: ForkTree<Block = Self>;

    /// Build an unmined block extending `self`. `tree` holds `self` and all
    /// of its ancestors.
    fn candidate<F>(&self, tree: &F) -> Result<Self, F::QueryError>
    where
        F: ForkTree<Block = Self>;

    fn unmined_genesis() -> Self;
}

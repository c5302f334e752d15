//! Reference proof-of-work block.
//!
//! The hash covers a fixed header layout: parent, height, timestamp, target,
//! nonce, the related ancestor hashes and a digest of the payload. A block is
//! valid when its hash, read as a big-endian integer, does not exceed its
//! target. Related ancestors sit at heights `h - 2^k` for every `k >= 1` that
//! stays above genesis, so any block lets a peer fetch a sparse skeleton of
//! its chain in one round.

use blockchain::{ForkTree, Identified};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Block, Hash, ValidationError};

/// Target used by [`Block::unmined_genesis`] and inherited by its children.
pub const DEFAULT_TARGET: Hash = Hash::with_leading_zeros(16);

pub const MAX_PAYLOAD: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StandardBlock {
    pub parent_hash: Hash,
    pub height: u64,
    pub timestamp: u64,
    pub target: Hash,
    pub nonce: u64,
    pub ancestors: Vec<Hash>,
    pub payload: Vec<u8>,
}

/// Heights of the related ancestors of a block at `height`.
pub fn related_heights(height: u64) -> impl Iterator<Item = u64> {
    (1..64)
        .map(|k| 1u64 << k)
        .take_while(move |step| *step <= height)
        .map(move |step| height - step)
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl StandardBlock {
    /// An unmined genesis block with the given target.
    pub fn genesis(target: Hash, payload: Vec<u8>) -> Self {
        Self {
            parent_hash: Hash::ZERO,
            height: 0,
            timestamp: 0,
            target,
            nonce: 0,
            ancestors: Vec::new(),
            payload,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Search nonces on the calling thread until the proof is valid.
    pub fn solve(&mut self) {
        while !self.valid_proof() {
            self.increment_nonce();
        }
    }

    fn header_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.target.as_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.update((self.ancestors.len() as u64).to_be_bytes());
        for ancestor in &self.ancestors {
            hasher.update(ancestor.as_bytes());
        }
        hasher.update(Sha256::digest(&self.payload));
        Hash(hasher.finalize().into())
    }
}

impl Identified for StandardBlock {
    type Identifier = Hash;

    fn id(&self) -> Hash {
        self.header_hash()
    }

    fn parent_id(&self) -> Option<Hash> {
        if self.height == 0 {
            None
        } else {
            Some(self.parent_hash)
        }
    }
}

impl Block for StandardBlock {
    fn height(&self) -> u64 {
        self.height
    }

    fn serialize(&self) -> Vec<u8> {
        // Plain data, encoding cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    fn related_blocks(&self) -> Vec<Hash> {
        self.parent_id()
            .into_iter()
            .chain(self.ancestors.iter().copied())
            .collect()
    }

    fn valid_proof(&self) -> bool {
        self.header_hash() <= self.target
    }

    fn increment_nonce(&mut self) {
        self.nonce = self.nonce.wrapping_add(1);
    }

    fn assert_internal_consistency(&self) -> Result<(), ValidationError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(ValidationError::Oversized {
                size: self.payload.len(),
                limit: MAX_PAYLOAD,
            });
        }

        if self.height == 0 && !self.parent_hash.is_zero() {
            return Err(ValidationError::Inconsistent(
                "genesis must not reference a parent".into(),
            ));
        }
        if self.height > 0 && self.parent_hash.is_zero() {
            return Err(ValidationError::Inconsistent(
                "non-genesis block without parent".into(),
            ));
        }

        let expected = related_heights(self.height).count();
        if self.ancestors.len() != expected {
            return Err(ValidationError::InvalidAncestors {
                expected,
                found: self.ancestors.len(),
            });
        }

        if !self.valid_proof() {
            return Err(ValidationError::InvalidProof);
        }

        Ok(())
    }

    fn assert_valid_child<F>(&self, parent: &Self, tree: &F) -> Result<(), ValidationError>
    where
        F: ForkTree<Block = Self>,
    {
        if self.target != parent.target {
            return Err(ValidationError::TargetMismatch {
                expected: parent.target,
                found: self.target,
            });
        }

        let parent_id = parent.id();
        for (height, claimed) in related_heights(self.height).zip(&self.ancestors) {
            match tree.ancestor_id_at_depth(&parent_id, height as usize) {
                Ok(actual) if actual == *claimed => {}
                _ => return Err(ValidationError::UnrelatedAncestor { height }),
            }
        }

        Ok(())
    }

    fn candidate<F>(&self, tree: &F) -> Result<Self, F::QueryError>
    where
        F: ForkTree<Block = Self>,
    {
        let id = self.id();
        let height = self.height + 1;

        let mut ancestors = Vec::new();
        for ancestor_height in related_heights(height) {
            ancestors.push(tree.ancestor_id_at_depth(&id, ancestor_height as usize)?);
        }

        Ok(Self {
            parent_hash: id,
            height,
            timestamp: now(),
            target: self.target,
            nonce: 0,
            ancestors,
            payload: Vec::new(),
        })
    }

    fn unmined_genesis() -> Self {
        Self {
            timestamp: now(),
            ..Self::genesis(DEFAULT_TARGET, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockchain::memory::MemoryForkTree;
    use blockchain::ForkTreeMut;

    const EASY: Hash = Hash::with_leading_zeros(4);

    #[test]
    fn related_heights_are_powers_of_two_back() {
        assert_eq!(related_heights(0).count(), 0);
        assert_eq!(related_heights(1).count(), 0);
        assert_eq!(related_heights(2).collect::<Vec<_>>(), vec![0]);
        assert_eq!(related_heights(11).collect::<Vec<_>>(), vec![9, 7, 3]);
        assert_eq!(related_heights(16).collect::<Vec<_>>(), vec![14, 12, 8, 0]);
    }

    #[test]
    fn candidates_reference_skip_ancestors() {
        let mut genesis = StandardBlock::genesis(EASY, b"genesis".to_vec());
        genesis.solve();
        let mut tree = MemoryForkTree::new();
        tree.insert(genesis.clone()).unwrap();

        let mut chain = vec![genesis];
        for _ in 0..10 {
            let mut next = chain.last().unwrap().candidate(&tree).unwrap();
            next.solve();
            next.assert_internal_consistency().unwrap();
            tree.insert(next.clone()).unwrap();
            chain.push(next);
        }

        let tip = chain.last().unwrap();
        assert_eq!(tip.height, 10);
        assert_eq!(
            tip.ancestors,
            vec![chain[8].id(), chain[6].id(), chain[2].id()]
        );
        assert_eq!(tip.related_blocks()[0], chain[9].id());
    }

    #[test]
    fn consistency_catches_tampering() {
        let mut genesis = StandardBlock::genesis(EASY, Vec::new());
        genesis.solve();
        assert_eq!(genesis.assert_internal_consistency(), Ok(()));
        assert_eq!(genesis.parent_id(), None);

        let mut impossible = genesis.clone();
        impossible.target = Hash::ZERO;
        assert_eq!(
            impossible.assert_internal_consistency(),
            Err(ValidationError::InvalidProof)
        );

        let mut missing_ancestors = StandardBlock {
            parent_hash: genesis.id(),
            height: 2,
            ..genesis.clone()
        };
        missing_ancestors.solve();
        assert_eq!(
            missing_ancestors.assert_internal_consistency(),
            Err(ValidationError::InvalidAncestors {
                expected: 1,
                found: 0
            })
        );

        let oversized = genesis.clone().with_payload(vec![0; MAX_PAYLOAD + 1]);
        assert!(matches!(
            oversized.assert_internal_consistency(),
            Err(ValidationError::Oversized { .. })
        ));
    }

    #[test]
    fn children_inherit_target_and_ancestors() {
        let mut genesis = StandardBlock::genesis(EASY, Vec::new());
        genesis.solve();
        let mut tree = MemoryForkTree::new();
        tree.insert(genesis.clone()).unwrap();
        let mut first = genesis.candidate(&tree).unwrap();
        first.solve();
        tree.insert(first.clone()).unwrap();

        let mut honest = first.candidate(&tree).unwrap();
        honest.solve();
        assert_eq!(honest.assert_valid_child(&first, &tree), Ok(()));

        let mut cheap = first.candidate(&tree).unwrap();
        cheap.target = Hash([0xff; 32]);
        assert_eq!(cheap.assert_internal_consistency(), Ok(()));
        assert_eq!(
            cheap.assert_valid_child(&first, &tree),
            Err(ValidationError::TargetMismatch {
                expected: EASY,
                found: Hash([0xff; 32]),
            })
        );

        let mut forged = first.candidate(&tree).unwrap();
        forged.ancestors = vec![first.id()];
        forged.solve();
        assert_eq!(forged.assert_internal_consistency(), Ok(()));
        assert_eq!(
            forged.assert_valid_child(&first, &tree),
            Err(ValidationError::UnrelatedAncestor { height: 0 })
        );
    }

    #[test]
    fn deserialize_rejects_garbage() {
        let mut genesis = StandardBlock::genesis(EASY, Vec::new());
        genesis.solve();
        let decoded = StandardBlock::deserialize(&genesis.serialize()).unwrap();
        assert_eq!(decoded.id(), genesis.id());

        assert!(matches!(
            StandardBlock::deserialize(b"\x01\x02not a block"),
            Err(ValidationError::Malformed(_))
        ));
    }
}

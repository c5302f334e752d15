//! Authoritative block tree and head selection.
//!
//! All mutation goes through [`Chain::set_genesis`] and [`Chain::add_block`],
//! which serialize on a single write lock. Fork choice is greatest height,
//! keeping the current head on ties, so the first block seen at a height
//! stays canonical.

use blockchain::memory::MemoryForkTree;
use blockchain::{ForkTree, ForkTreeMut, Identified, Store, StoreError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use sync_extra::RwLockExtra;
use tracing::{debug, info, trace, warn};

use crate::{Block, ChainConfig, ChainError, Hash, ValidationError};

/// Outcome of [`Chain::add_block`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acceptance {
    /// The block was already known. Nothing changed.
    Duplicate,
    /// The parent is unknown. The block is held until `missing`, the
    /// closest ancestor that is neither attached nor held, arrives.
    Orphan { missing: Hash },
    /// The block joined the tree, followed by every orphan it unlocked, in
    /// attachment order.
    Accepted {
        head_changed: bool,
        imported: Vec<Hash>,
    },
}

/// Notified after every head change, outside the chain lock.
pub trait HeadObserver<B>: Send + Sync {
    fn head_changed(&self, head: &B);
}

struct Orphans<B> {
    blocks: HashMap<Hash, B>,
    by_parent: HashMap<Hash, Vec<Hash>>,
    order: VecDeque<Hash>,
    limit: usize,
}

impl<B: Block> Orphans<B> {
    fn new(limit: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            by_parent: HashMap::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    fn get(&self, hash: &Hash) -> Option<&B> {
        self.blocks.get(hash)
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn insert(&mut self, parent: Hash, block: B) {
        if self.limit == 0 {
            return;
        }

        while self.blocks.len() >= self.limit {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            if let Some(block) = self.blocks.remove(&evicted) {
                debug!(hash = %evicted, "Evicting orphan");
                self.unlink(&block, &evicted);
            }
        }

        let hash = block.id();
        self.by_parent.entry(parent).or_default().push(hash);
        self.order.push_back(hash);
        self.blocks.insert(hash, block);
    }

    fn unlink(&mut self, block: &B, hash: &Hash) {
        if let Some(parent) = block.parent_id() {
            if let Some(siblings) = self.by_parent.get_mut(&parent) {
                siblings.retain(|h| h != hash);
                if siblings.is_empty() {
                    self.by_parent.remove(&parent);
                }
            }
        }
    }

    /// Follow held parents from `hash` to the first block that is not held.
    fn root_missing(&self, mut hash: Hash) -> Hash {
        while let Some(parent) = self.blocks.get(&hash).and_then(|block| block.parent_id()) {
            hash = parent;
        }
        hash
    }

    /// Remove and return every orphan waiting on `parent`.
    fn take_children(&mut self, parent: &Hash) -> Vec<B> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };

        self.order.retain(|h| !children.contains(h));
        children
            .iter()
            .filter_map(|hash| self.blocks.remove(hash))
            .collect()
    }
}

struct ChainInner<B: Block> {
    tree: MemoryForkTree<B>,
    genesis: Option<Hash>,
    head: Option<Hash>,
    orphans: Orphans<B>,
}

pub struct Chain<B: Block> {
    inner: RwLock<ChainInner<B>>,
    store: Arc<dyn Store>,
    observers: RwLock<Vec<Arc<dyn HeadObserver<B>>>>,
}

/// Checks against an attached parent.
fn check_child<B: Block>(
    tree: &MemoryForkTree<B>,
    parent_hash: &Hash,
    block: &B,
) -> Result<(), ChainError> {
    let parent = tree.block(parent_hash)?;
    if block.height() != parent.height() + 1 {
        return Err(ValidationError::InconsistentHeight {
            parent: parent.height(),
            found: block.height(),
        }
        .into());
    }
    block.assert_valid_child(parent, tree)?;
    Ok(())
}

impl<B: Block> Chain<B> {
    pub fn new(config: ChainConfig, store: Arc<dyn Store>) -> Self {
        Self {
            inner: RwLock::new(ChainInner {
                tree: MemoryForkTree::new(),
                genesis: None,
                head: None,
                orphans: Orphans::new(config.max_orphans),
            }),
            store,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Fix the genesis block. Setting the same genesis again is a no-op, a
    /// different one is a configuration error.
    pub fn set_genesis(&self, genesis: B) -> Result<(), ChainError> {
        let hash = genesis.id();

        {
            let mut inner = self.inner.write_unwrap();
            if let Some(existing) = inner.genesis {
                if existing == hash {
                    return Ok(());
                }
                return Err(ChainError::Configuration(format!(
                    "genesis already set to {}, refusing {}",
                    existing, hash
                )));
            }

            if genesis.height() != 0 || genesis.parent_id().is_some() {
                return Err(ChainError::Configuration(format!(
                    "genesis {} has height {}",
                    hash,
                    genesis.height()
                )));
            }
            genesis
                .assert_internal_consistency()
                .map_err(|e| ChainError::Configuration(format!("invalid genesis: {}", e)))?;

            self.persist(&genesis)?;
            inner.tree.insert(genesis.clone())?;
            inner.genesis = Some(hash);
            inner.head = Some(hash);
        }

        info!(%hash, "Genesis set");
        self.notify(&genesis);
        Ok(())
    }

    pub fn genesis_hash(&self) -> Option<Hash> {
        self.inner.read_unwrap().genesis
    }

    /// Whether the block is known, attached or orphaned.
    pub fn has_block_hash(&self, hash: &Hash) -> bool {
        let inner = self.inner.read_unwrap();
        inner.tree.contains(hash) || inner.orphans.contains(hash)
    }

    /// The hash to fetch so that `hash` can attach: `hash` itself when
    /// unknown, the root of its pending chain when held as an orphan, and
    /// `None` once attached.
    pub fn missing_ancestor(&self, hash: &Hash) -> Option<Hash> {
        let inner = self.inner.read_unwrap();
        let root = inner.orphans.root_missing(*hash);
        if inner.tree.contains(&root) {
            None
        } else {
            Some(root)
        }
    }

    /// Whether the block is attached to the tree rooted at genesis.
    pub fn is_attached(&self, hash: &Hash) -> bool {
        self.inner.read_unwrap().tree.contains(hash)
    }

    pub fn get_block(&self, hash: &Hash) -> Result<B, ChainError> {
        {
            let inner = self.inner.read_unwrap();
            if let Ok(block) = inner.tree.block(hash) {
                return Ok(block.clone());
            }
            if let Some(block) = inner.orphans.get(hash) {
                return Ok(block.clone());
            }
        }

        match self.store.get(hash.as_bytes())? {
            Some(bytes) => B::deserialize(&bytes)
                .map_err(|e| ChainError::Store(StoreError::Corrupt(e.to_string()))),
            None => Err(ChainError::NotFound(*hash)),
        }
    }

    pub fn head(&self) -> Result<B, ChainError> {
        let inner = self.inner.read_unwrap();
        let head = inner
            .head
            .ok_or_else(|| ChainError::Configuration("genesis is not set".into()))?;
        Ok(inner.tree.block(&head)?.clone())
    }

    pub fn head_hash(&self) -> Option<Hash> {
        self.inner.read_unwrap().head
    }

    pub fn height(&self) -> Result<u64, ChainError> {
        self.head().map(|head| head.height())
    }

    /// Number of attached blocks, genesis included.
    pub fn len(&self) -> usize {
        self.inner.read_unwrap().tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read_unwrap().tree.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.inner.read_unwrap().orphans.len()
    }

    /// An unmined block extending the current head.
    pub fn candidate(&self) -> Result<B, ChainError> {
        let inner = self.inner.read_unwrap();
        let head = inner
            .head
            .ok_or_else(|| ChainError::Configuration("genesis is not set".into()))?;
        Ok(inner.tree.block(&head)?.candidate(&inner.tree)?)
    }

    pub fn subscribe(&self, observer: Arc<dyn HeadObserver<B>>) {
        self.observers.write_unwrap().push(observer);
    }

    /// Validate and insert a block, attach any orphans waiting on it and
    /// recompute the head. Failures leave the chain untouched.
    pub fn add_block(&self, block: B) -> Result<Acceptance, ChainError> {
        let hash = block.id();
        if self.has_block_hash(&hash) {
            trace!(%hash, "Ignoring known block");
            return Ok(Acceptance::Duplicate);
        }

        block.assert_internal_consistency()?;
        let parent_hash = block
            .parent_id()
            .ok_or(ValidationError::UnexpectedGenesis)?;

        let (acceptance, new_head) = {
            let mut inner = self.inner.write_unwrap();
            let head = inner
                .head
                .ok_or_else(|| ChainError::Configuration("genesis is not set".into()))?;

            // Checked again, another writer may have raced us here.
            if inner.tree.contains(&hash) || inner.orphans.contains(&hash) {
                return Ok(Acceptance::Duplicate);
            }

            if !inner.tree.contains(&parent_hash) {
                let missing = inner.orphans.root_missing(parent_hash);
                debug!(%hash, parent = %parent_hash, %missing, height = block.height(), "Holding orphan");
                inner.orphans.insert(parent_hash, block);
                return Ok(Acceptance::Orphan { missing });
            }

            check_child(&inner.tree, &parent_hash, &block)?;
            self.persist(&block)?;
            inner.tree.insert(block)?;

            let mut imported = vec![hash];
            let mut cursor = 0;
            while cursor < imported.len() {
                let parent = imported[cursor];
                cursor += 1;

                for child in inner.orphans.take_children(&parent) {
                    let child_hash = child.id();
                    if let Err(e) = check_child(&inner.tree, &parent, &child) {
                        warn!(hash = %child_hash, "Dropping orphan: {}", e);
                        continue;
                    }
                    if let Err(e) = self.persist(&child) {
                        warn!(hash = %child_hash, "Dropping orphan: {}", e);
                        continue;
                    }
                    inner.tree.insert(child)?;
                    debug!(hash = %child_hash, "Attached orphan");
                    imported.push(child_hash);
                }
            }

            let mut best = head;
            let mut best_height = inner.tree.block(&head)?.height();
            for candidate in &imported {
                let height = inner.tree.block(candidate)?.height();
                if height > best_height {
                    best = *candidate;
                    best_height = height;
                }
            }

            let head_changed = best != head;
            let new_head = if head_changed {
                inner.head = Some(best);
                Some(inner.tree.block(&best)?.clone())
            } else {
                None
            };

            (
                Acceptance::Accepted {
                    head_changed,
                    imported,
                },
                new_head,
            )
        };

        if let Some(head) = new_head {
            info!(hash = %head.id(), height = head.height(), "New head");
            self.notify(&head);
        }

        Ok(acceptance)
    }

    fn persist(&self, block: &B) -> Result<(), StoreError> {
        self.store.put(block.id().as_bytes(), block.serialize())
    }

    fn notify(&self, head: &B) {
        let observers = self.observers.read_unwrap().clone();
        for observer in observers {
            observer.head_changed(head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standard::StandardBlock;
    use crate::testing::{easy_genesis, mine_on, new_chain};
    use blockchain::memory::MemoryStore;
    use std::sync::Mutex;
    use sync_extra::MutexExtra;

    #[test]
    fn genesis_is_set_once() {
        let (chain, genesis) = new_chain();
        assert_eq!(chain.genesis_hash(), Some(genesis.id()));
        assert_eq!(chain.height().unwrap(), 0);

        chain.set_genesis(genesis.clone()).unwrap();

        let other = StandardBlock {
            payload: b"other".to_vec(),
            ..genesis
        };
        assert!(matches!(
            chain.set_genesis(other),
            Err(ChainError::Configuration(_))
        ));
    }

    #[test]
    fn blocks_need_genesis() {
        let chain = Chain::new(ChainConfig::default(), Arc::new(MemoryStore::new()));
        let genesis = easy_genesis();
        let (builder, _) = new_chain();
        let block = mine_on(&builder, b"a");

        assert!(chain.head().is_err());
        assert!(matches!(
            chain.add_block(block),
            Err(ChainError::Configuration(_))
        ));
        chain.set_genesis(genesis).unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn accepting_extends_head_and_is_idempotent() {
        let (chain, genesis) = new_chain();
        let block = mine_on(&chain, b"one");

        let acceptance = chain.add_block(block.clone()).unwrap();
        assert_eq!(
            acceptance,
            Acceptance::Accepted {
                head_changed: true,
                imported: vec![block.id()],
            }
        );
        assert!(chain.has_block_hash(&block.id()));
        assert_eq!(chain.head().unwrap().id(), block.id());
        assert_eq!(chain.height().unwrap(), 1);

        assert_eq!(chain.add_block(block.clone()).unwrap(), Acceptance::Duplicate);
        assert_eq!(chain.add_block(genesis).unwrap(), Acceptance::Duplicate);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn inconsistent_height_is_rejected_without_mutation() {
        let (chain, _) = new_chain();
        let first = mine_on(&chain, b"one");
        chain.add_block(first).unwrap();

        let mut skipping = chain.candidate().unwrap();
        skipping.height = 3;
        skipping.solve();

        assert!(matches!(
            chain.add_block(skipping.clone()),
            Err(ChainError::Validation(ValidationError::InconsistentHeight {
                parent: 1,
                found: 3
            }))
        ));
        assert!(!chain.has_block_hash(&skipping.id()));
        assert_eq!(chain.height().unwrap(), 1);
    }

    #[test]
    fn invalid_proof_is_rejected() {
        let (chain, _) = new_chain();
        let mut block = chain.candidate().unwrap();
        block.target = Hash::ZERO;

        assert!(matches!(
            chain.add_block(block),
            Err(ChainError::Validation(ValidationError::InvalidProof))
        ));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn children_cannot_lower_the_target() {
        let (chain, genesis) = new_chain();
        let mut cheap = chain.candidate().unwrap();
        cheap.target = Hash([0xff; 32]);

        assert!(matches!(
            chain.add_block(cheap.clone()),
            Err(ChainError::Validation(ValidationError::TargetMismatch { .. }))
        ));
        assert!(!chain.has_block_hash(&cheap.id()));
        assert_eq!(chain.head_hash(), Some(genesis.id()));

        // Same block arriving ahead of its parent is dropped on attachment.
        let (builder, _) = new_chain();
        let first = mine_on(&builder, b"first");
        builder.add_block(first.clone()).unwrap();
        let mut cheap_child = builder.candidate().unwrap();
        cheap_child.target = Hash([0xff; 32]);

        assert_eq!(
            chain.add_block(cheap_child.clone()).unwrap(),
            Acceptance::Orphan {
                missing: first.id()
            }
        );
        assert_eq!(
            chain.add_block(first.clone()).unwrap(),
            Acceptance::Accepted {
                head_changed: true,
                imported: vec![first.id()],
            }
        );
        assert!(!chain.has_block_hash(&cheap_child.id()));
        assert_eq!(chain.height().unwrap(), 1);
    }

    #[test]
    fn pending_chains_report_their_root() {
        let (builder, genesis) = new_chain();
        let mut blocks = Vec::new();
        for i in 0..3u8 {
            let block = mine_on(&builder, &[i]);
            builder.add_block(block.clone()).unwrap();
            blocks.push(block);
        }

        let chain = Chain::new(ChainConfig::default(), Arc::new(MemoryStore::new()));
        chain.set_genesis(genesis.clone()).unwrap();
        let root = blocks[0].id();

        chain.add_block(blocks[1].clone()).unwrap();
        assert_eq!(
            chain.add_block(blocks[2].clone()).unwrap(),
            Acceptance::Orphan { missing: root }
        );
        assert_eq!(chain.missing_ancestor(&blocks[2].id()), Some(root));
        assert_eq!(chain.missing_ancestor(&blocks[1].id()), Some(root));
        assert_eq!(chain.missing_ancestor(&root), Some(root));
        assert_eq!(chain.missing_ancestor(&genesis.id()), None);

        chain.add_block(blocks[0].clone()).unwrap();
        assert_eq!(chain.missing_ancestor(&blocks[2].id()), None);
    }

    #[test]
    fn orphans_attach_when_parent_arrives() {
        let (builder, genesis) = new_chain();
        let mut blocks = Vec::new();
        for i in 0..4u8 {
            let block = mine_on(&builder, &[i]);
            builder.add_block(block.clone()).unwrap();
            blocks.push(block);
        }

        let chain = Chain::new(ChainConfig::default(), Arc::new(MemoryStore::new()));
        chain.set_genesis(genesis).unwrap();

        for block in blocks[1..].iter().rev() {
            assert_eq!(
                chain.add_block(block.clone()).unwrap(),
                Acceptance::Orphan {
                    missing: block.parent_hash
                }
            );
        }
        assert_eq!(chain.orphan_count(), 3);
        assert!(chain.has_block_hash(&blocks[3].id()));
        assert!(!chain.is_attached(&blocks[3].id()));
        assert_eq!(chain.get_block(&blocks[2].id()).unwrap(), blocks[2]);

        let acceptance = chain.add_block(blocks[0].clone()).unwrap();
        assert_eq!(
            acceptance,
            Acceptance::Accepted {
                head_changed: true,
                imported: blocks.iter().map(|b| b.id()).collect(),
            }
        );
        assert_eq!(chain.orphan_count(), 0);
        assert_eq!(chain.head().unwrap().id(), blocks[3].id());
        assert_eq!(chain.head_hash(), builder.head_hash());
    }

    #[test]
    fn first_seen_wins_equal_height() {
        let (builder, genesis) = new_chain();
        let left = mine_on(&builder, b"left");
        let right = mine_on(&builder, b"right");
        assert_ne!(left.id(), right.id());

        for (first, second) in [(&left, &right), (&right, &left)] {
            let chain = Chain::new(ChainConfig::default(), Arc::new(MemoryStore::new()));
            chain.set_genesis(genesis.clone()).unwrap();

            chain.add_block(first.clone()).unwrap();
            assert_eq!(
                chain.add_block(second.clone()).unwrap(),
                Acceptance::Accepted {
                    head_changed: false,
                    imported: vec![second.id()],
                }
            );
            assert_eq!(chain.head().unwrap().id(), first.id());
        }
    }

    #[test]
    fn longer_fork_takes_over() {
        let (chain, _) = new_chain();
        let main = mine_on(&chain, b"main");
        let side = mine_on(&chain, b"side");
        chain.add_block(main.clone()).unwrap();
        chain.add_block(side.clone()).unwrap();
        assert_eq!(chain.head_hash(), Some(main.id()));

        let tree_view = Chain::new(ChainConfig::default(), Arc::new(MemoryStore::new()));
        tree_view.set_genesis(easy_genesis()).unwrap();
        tree_view.add_block(side.clone()).unwrap();
        let mut side_child = tree_view.candidate().unwrap();
        side_child.solve();

        let acceptance = chain.add_block(side_child.clone()).unwrap();
        assert!(matches!(
            acceptance,
            Acceptance::Accepted {
                head_changed: true,
                ..
            }
        ));
        assert_eq!(chain.head_hash(), Some(side_child.id()));
    }

    #[test]
    fn orphan_pool_is_bounded() {
        let (builder, genesis) = new_chain();
        let mut blocks = Vec::new();
        for i in 0..4u8 {
            let block = mine_on(&builder, &[i]);
            builder.add_block(block.clone()).unwrap();
            blocks.push(block);
        }

        let chain = Chain::new(ChainConfig { max_orphans: 2 }, Arc::new(MemoryStore::new()));
        chain.set_genesis(genesis).unwrap();
        for block in &blocks[1..] {
            chain.add_block(block.clone()).unwrap();
        }

        assert_eq!(chain.orphan_count(), 2);
        assert!(!chain.has_block_hash(&blocks[1].id()));

        // Without block 1 nothing can attach.
        let acceptance = chain.add_block(blocks[0].clone()).unwrap();
        assert_eq!(
            acceptance,
            Acceptance::Accepted {
                head_changed: true,
                imported: vec![blocks[0].id()],
            }
        );
        assert_eq!(chain.orphan_count(), 2);
    }

    #[test]
    fn blocks_are_written_through_to_store() {
        let store = Arc::new(MemoryStore::new());
        let chain = Chain::new(ChainConfig::default(), store.clone());
        let genesis = easy_genesis();
        chain.set_genesis(genesis.clone()).unwrap();
        let block = mine_on(&chain, b"stored");
        chain.add_block(block.clone()).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get(block.id().as_bytes()).unwrap(),
            Some(block.serialize())
        );

        // Only in the store, e.g. written by a previous run.
        let (other_builder, _) = new_chain();
        let elsewhere = mine_on(&other_builder, b"elsewhere");
        store
            .put(elsewhere.id().as_bytes(), elsewhere.serialize())
            .unwrap();
        assert_eq!(chain.get_block(&elsewhere.id()).unwrap(), elsewhere);

        assert!(matches!(
            chain.get_block(&Hash::digest(b"missing")),
            Err(ChainError::NotFound(_))
        ));
    }

    #[derive(Default)]
    struct HeadLog(Mutex<Vec<u64>>);

    impl HeadObserver<StandardBlock> for HeadLog {
        fn head_changed(&self, head: &StandardBlock) {
            self.0.lock_unwrap().push(head.height);
        }
    }

    #[test]
    fn observers_see_head_changes_only() {
        let (chain, _) = new_chain();
        let log = Arc::new(HeadLog::default());
        chain.subscribe(log.clone());

        let first = mine_on(&chain, b"first");
        let rival = mine_on(&chain, b"rival");
        chain.add_block(first).unwrap();
        chain.add_block(rival).unwrap();
        let second = mine_on(&chain, b"second");
        chain.add_block(second).unwrap();

        assert_eq!(*log.0.lock_unwrap(), vec![1, 2]);
    }
}

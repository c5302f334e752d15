//! Shared fixtures for unit tests.

use blockchain::memory::MemoryStore;
use blockchain::{ForkTree, Identified};
use blocknet::{Message, MessageService, NetworkService};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use sync_extra::MutexExtra;

use crate::standard::StandardBlock;
use crate::{Block, Chain, ChainConfig, Hash, ValidationError};

pub const EASY: Hash = Hash::with_leading_zeros(6);

pub fn easy_genesis() -> StandardBlock {
    let mut genesis = StandardBlock::genesis(EASY, b"test genesis".to_vec());
    genesis.solve();
    genesis
}

pub fn chain_from(genesis: &StandardBlock) -> Arc<Chain<StandardBlock>> {
    let chain = Arc::new(Chain::new(ChainConfig::default(), Arc::new(MemoryStore::new())));
    chain
        .set_genesis(genesis.clone())
        .expect("genesis is valid");
    chain
}

pub fn new_chain() -> (Arc<Chain<StandardBlock>>, StandardBlock) {
    let genesis = easy_genesis();
    (chain_from(&genesis), genesis)
}

/// A solved block on top of the current head. Not added.
pub fn mine_on(chain: &Chain<StandardBlock>, payload: &[u8]) -> StandardBlock {
    let mut block = chain
        .candidate()
        .expect("chain has a head")
        .with_payload(payload.to_vec());
    block.solve();
    block
}

pub fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Transport that only records what it is asked to send.
#[derive(Default)]
pub struct RecordingService {
    broadcasts: Mutex<Vec<Message>>,
    notifies: Mutex<Vec<(u64, Message)>>,
}

impl RecordingService {
    pub fn broadcasts_named(&self, name: &str) -> Vec<Vec<u8>> {
        self.broadcasts
            .lock_unwrap()
            .iter()
            .filter(|message| message.name == name)
            .map(|message| message.payload.clone())
            .collect()
    }

    pub fn notifies_named(&self, name: &str) -> Vec<(u64, Vec<u8>)> {
        self.notifies
            .lock_unwrap()
            .iter()
            .filter(|(_, message)| message.name == name)
            .map(|(peer, message)| (*peer, message.payload.clone()))
            .collect()
    }
}

impl NetworkService for RecordingService {
    type PeerId = u64;
    type Error = Infallible;
}

impl MessageService for RecordingService {
    fn notify(&self, peer: &u64, message: Message) -> Result<(), Infallible> {
        self.notifies.lock_unwrap().push((*peer, message));
        Ok(())
    }

    fn broadcast(&self, message: Message) -> Result<(), Infallible> {
        self.broadcasts.lock_unwrap().push(message);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Kind {
    /// Valid once the nonce reaches 3.
    Solvable,
    /// Never has a valid proof.
    Unsolvable,
    /// Has a proof but fails the consistency check.
    Broken,
}

/// Block with controllable proof behaviour. Children inherit `children`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MockBlock {
    pub parent: Option<Hash>,
    pub height: u64,
    pub nonce: u64,
    pub kind: Kind,
    pub children: Kind,
}

impl MockBlock {
    pub fn genesis(children: Kind) -> Self {
        Self {
            parent: None,
            height: 0,
            nonce: 3,
            kind: Kind::Solvable,
            children,
        }
    }

    pub fn child_of(parent: &MockBlock, kind: Kind, nonce: u64) -> Self {
        Self {
            parent: Some(parent.id()),
            height: parent.height + 1,
            nonce,
            kind,
            children: parent.children,
        }
    }
}

impl Identified for MockBlock {
    type Identifier = Hash;

    fn id(&self) -> Hash {
        Hash::digest(&self.serialize())
    }

    fn parent_id(&self) -> Option<Hash> {
        self.parent
    }
}

impl Block for MockBlock {
    fn height(&self) -> u64 {
        self.height
    }

    fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("mock block encodes")
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    fn related_blocks(&self) -> Vec<Hash> {
        self.parent.into_iter().collect()
    }

    fn valid_proof(&self) -> bool {
        self.kind != Kind::Unsolvable && self.nonce >= 3
    }

    fn increment_nonce(&mut self) {
        self.nonce += 1;
    }

    fn assert_internal_consistency(&self) -> Result<(), ValidationError> {
        if self.kind == Kind::Broken {
            return Err(ValidationError::Inconsistent("broken on purpose".into()));
        }
        if !self.valid_proof() {
            return Err(ValidationError::InvalidProof);
        }
        Ok(())
    }

    fn assert_valid_child<F>(&self, _parent: &Self, _tree: &F) -> Result<(), ValidationError>
    where
        F: ForkTree<Block = Self>,
    {
        Ok(())
    }

    fn candidate<F>(&self, _tree: &F) -> Result<Self, F::QueryError>
    where
        F: ForkTree<Block = Self>,
    {
        Ok(Self {
            parent: Some(self.id()),
            height: self.height + 1,
            nonce: 0,
            kind: self.children,
            children: self.children,
        })
    }

    fn unmined_genesis() -> Self {
        Self {
            nonce: 0,
            ..Self::genesis(Kind::Solvable)
        }
    }
}

//! Inbound protocol messages mapped onto chain and sync operations.

use blocknet::{Listener, Message, MessageService, NetworkService};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash as StdHash;
use std::sync::{Arc, Mutex, RwLock};
use sync_extra::{MutexExtra, RwLockExtra};
use tracing::{debug, info, trace, warn};

use crate::messages::{BlockList, HashList, Intro, Payload, BLOCKS, INTRO, REQUEST_BLOCKS};
use crate::seek::Priority;
use crate::{Block, ChainError, Hash, RouterConfig, RouterError, SeekNBuild};

/// Called when a peer sends something it should not have.
pub trait Misbehaviour<PeerId>: Send + Sync {
    fn misbehaving(&self, peer: &PeerId, reason: &str);
}

/// Logs and counts offences. Never disconnects anyone.
pub struct Permissive<PeerId> {
    offences: Mutex<HashMap<PeerId, u64>>,
}

impl<PeerId> Default for Permissive<PeerId> {
    fn default() -> Self {
        Self {
            offences: Mutex::new(HashMap::new()),
        }
    }
}

impl<PeerId: Eq + StdHash> Permissive<PeerId> {
    pub fn offences(&self, peer: &PeerId) -> u64 {
        self.offences
            .lock_unwrap()
            .get(peer)
            .copied()
            .unwrap_or_default()
    }
}

impl<PeerId> Misbehaviour<PeerId> for Permissive<PeerId>
where
    PeerId: Clone + Eq + StdHash + Debug + Send + Sync,
{
    fn misbehaving(&self, peer: &PeerId, reason: &str) {
        let mut offences = self.offences.lock_unwrap();
        let count = offences.entry(peer.clone()).or_default();
        *count += 1;
        warn!(?peer, offences = *count, "Peer misbehaving: {}", reason);
    }
}

type Handler<B, T> = fn(
    &ProtocolRouter<B, T>,
    &<T as NetworkService>::PeerId,
    &[u8],
) -> Result<(), RouterError>;

pub struct ProtocolRouter<B: Block, T: MessageService> {
    seek: Arc<SeekNBuild<B, T>>,
    transport: Arc<T>,
    intros: RwLock<HashMap<T::PeerId, Intro>>,
    handlers: HashMap<&'static str, Handler<B, T>>,
    penalty: Arc<dyn Misbehaviour<T::PeerId>>,
    config: RouterConfig,
    network_debug: bool,
}

impl<B: Block, T: MessageService> ProtocolRouter<B, T> {
    pub fn new(
        seek: Arc<SeekNBuild<B, T>>,
        transport: Arc<T>,
        config: RouterConfig,
        network_debug: bool,
        penalty: Arc<dyn Misbehaviour<T::PeerId>>,
    ) -> Self {
        let mut handlers: HashMap<&'static str, Handler<B, T>> = HashMap::new();
        handlers.insert(INTRO, Self::handle_intro);
        handlers.insert(BLOCKS, Self::handle_blocks);
        handlers.insert(REQUEST_BLOCKS, Self::handle_request_blocks);

        Self {
            seek,
            transport,
            intros: RwLock::new(HashMap::new()),
            handlers,
            penalty,
            config,
            network_debug,
        }
    }

    /// Last head announced by `peer`.
    pub fn intro_of(&self, peer: &T::PeerId) -> Option<Intro> {
        self.intros.read_unwrap().get(peer).cloned()
    }

    fn send(&self, peer: &T::PeerId, message: Message) -> Result<(), RouterError> {
        self.transport
            .notify(peer, message)
            .map_err(|e| RouterError::Transport(e.to_string()))
    }

    fn handle_intro(&self, peer: &T::PeerId, payload: &[u8]) -> Result<(), RouterError> {
        let intro = Intro::decode(payload)?;
        let top_block = intro.top_block;
        self.intros.write_unwrap().insert(peer.clone(), intro);

        if !self.seek.chain().is_attached(&top_block) {
            debug!(?peer, hash = %top_block, "Peer announced unattached head");
            self.seek.seek_hash_now(top_block);
        }
        Ok(())
    }

    fn handle_blocks(&self, peer: &T::PeerId, payload: &[u8]) -> Result<(), RouterError> {
        let BlockList(encoded) = BlockList::decode(payload)?;

        for bytes in encoded {
            let block = match B::deserialize(&bytes)
                .and_then(|block| block.assert_internal_consistency().map(|()| block))
            {
                Ok(block) => block,
                Err(e) => {
                    self.penalty.misbehaving(peer, &e.to_string());
                    continue;
                }
            };

            let related = block.related_blocks();
            match self.seek.add_block(block) {
                Ok(acceptance) => trace!(?peer, ?acceptance, "Received block"),
                Err(ChainError::Validation(e)) => {
                    self.penalty.misbehaving(peer, &e.to_string());
                    continue;
                }
                Err(e) => {
                    warn!(?peer, "Failed to add block: {}", e);
                    continue;
                }
            }
            self.seek.seek_many_with_priority(related, Priority::Related);
        }
        Ok(())
    }

    fn handle_request_blocks(&self, peer: &T::PeerId, payload: &[u8]) -> Result<(), RouterError> {
        let HashList(wanted) = HashList::decode(payload)?;
        let chain = self.seek.chain();

        let mut found = Vec::new();
        for hash in wanted.iter().take(self.config.max_response_blocks) {
            match chain.get_block(hash) {
                Ok(block) => found.push(block.serialize()),
                Err(ChainError::NotFound(_)) => {}
                Err(e) => warn!(%hash, "Cannot serve block: {}", e),
            }
        }

        if found.is_empty() {
            return Ok(());
        }
        debug!(?peer, count = found.len(), "Serving blocks");
        self.send(peer, BlockList(found).to_message()?)
    }
}

impl<B: Block, T: MessageService> Listener<T::PeerId> for ProtocolRouter<B, T> {
    fn on_connect(&self, peer: T::PeerId) {
        let Some(top_block) = self.seek.chain().head_hash() else {
            return;
        };

        let sent = Intro { top_block }
            .to_message()
            .and_then(|message| self.send(&peer, message));
        if let Err(e) = sent {
            warn!(?peer, "Failed to send intro: {}", e);
        }
    }

    fn on_message(&self, peer: T::PeerId, message: Message) {
        if self.network_debug {
            info!(?peer, name = %message.name, digest = %Hash::digest(&message.payload), "Received message");
        } else {
            debug!(?peer, name = %message.name, size = message.payload.len(), "Received message");
        }

        let Some(handler) = self.handlers.get(&*message.name) else {
            debug!(?peer, name = %message.name, "Ignoring unknown message");
            return;
        };

        if let Err(e) = handler(self, &peer, &message.payload) {
            if let RouterError::Decode { .. } = e {
                self.penalty.misbehaving(&peer, &e.to_string());
            } else {
                warn!(?peer, name = %message.name, "Failed to handle message: {}", e);
            }
        }
    }

    fn on_disconnect(&self, peer: T::PeerId) {
        self.intros.write_unwrap().remove(&peer);
    }
}

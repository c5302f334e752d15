//! In-process network. Every peer gets its own delivery thread, so listeners
//! observe the same threading they would on a real transport. Useful for
//! testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread::{self, JoinHandle};
use sync_extra::RwLockExtra;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{Listener, Message, MessageService, NetworkService};

pub type PeerId = u64;

enum Envelope {
    Connected(PeerId),
    Disconnected(PeerId),
    Message(PeerId, Message),
    Shutdown,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("peer {0} stopped receiving")]
    Closed(PeerId),
    #[error("failed to spawn delivery thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Default)]
struct NetworkInner {
    peers: RwLock<HashMap<PeerId, mpsc::Sender<Envelope>>>,
    next_id: AtomicU64,
}

/// A fully connected in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a peer slot. The peer is not reachable until its inbox is
    /// started, so the service can be handed to whatever builds the listener.
    pub fn join(&self) -> (MemoryService, MemoryInbox) {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel();

        (
            MemoryService {
                id,
                network: self.inner.clone(),
            },
            MemoryInbox {
                id,
                network: self.inner.clone(),
                sender,
                receiver,
            },
        )
    }

    /// Ids of all started peers.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers = self.inner.peers.read_unwrap().keys().copied().collect::<Vec<_>>();
        peers.sort_unstable();
        peers
    }
}

/// Outbound handle of a memory peer.
#[derive(Clone)]
pub struct MemoryService {
    id: PeerId,
    network: Arc<NetworkInner>,
}

impl MemoryService {
    pub fn local_peer_id(&self) -> PeerId {
        self.id
    }
}

impl NetworkService for MemoryService {
    type PeerId = PeerId;
    type Error = MemoryError;
}

impl MessageService for MemoryService {
    fn notify(&self, peer: &PeerId, message: Message) -> Result<(), MemoryError> {
        let peers = self.network.peers.read_unwrap();
        let sender = peers.get(peer).ok_or(MemoryError::UnknownPeer(*peer))?;
        sender
            .send(Envelope::Message(self.id, message))
            .map_err(|_| MemoryError::Closed(*peer))
    }

    fn broadcast(&self, message: Message) -> Result<(), MemoryError> {
        let peers = self.network.peers.read_unwrap();
        for (peer, sender) in peers.iter().filter(|(peer, _)| **peer != self.id) {
            if sender
                .send(Envelope::Message(self.id, message.clone()))
                .is_err()
            {
                debug!(peer, "Skipping closed peer in broadcast");
            }
        }
        Ok(())
    }
}

/// Inbound half of a memory peer, before it is started.
pub struct MemoryInbox {
    id: PeerId,
    network: Arc<NetworkInner>,
    sender: mpsc::Sender<Envelope>,
    receiver: mpsc::Receiver<Envelope>,
}

impl MemoryInbox {
    /// Connect to every started peer and begin delivering to `listener`.
    pub fn start(self, listener: Arc<dyn Listener<PeerId>>) -> Result<MemoryPeer, MemoryError> {
        let id = self.id;
        let receiver = self.receiver;

        let thread = thread::Builder::new()
            .name(format!("memory-peer-{}", id))
            .spawn(move || {
                for envelope in receiver {
                    match envelope {
                        Envelope::Connected(peer) => listener.on_connect(peer),
                        Envelope::Disconnected(peer) => listener.on_disconnect(peer),
                        Envelope::Message(peer, message) => {
                            trace!(id, peer, name = %message.name, "Delivering message");
                            listener.on_message(peer, message)
                        }
                        Envelope::Shutdown => break,
                    }
                }
            })?;

        {
            let mut peers = self.network.peers.write_unwrap();
            for (peer, sender) in peers.iter() {
                let _ = sender.send(Envelope::Connected(id));
                let _ = self.sender.send(Envelope::Connected(*peer));
            }
            peers.insert(id, self.sender.clone());
        }

        Ok(MemoryPeer {
            id,
            network: self.network,
            sender: self.sender,
            thread: Some(thread),
        })
    }
}

/// A started memory peer. Dropping it leaves the network.
pub struct MemoryPeer {
    id: PeerId,
    network: Arc<NetworkInner>,
    sender: mpsc::Sender<Envelope>,
    thread: Option<JoinHandle<()>>,
}

impl MemoryPeer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Disconnect from all peers and wait for pending deliveries to finish.
    pub fn leave(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        {
            let mut peers = self.network.peers.write_unwrap();
            peers.remove(&self.id);
            for sender in peers.values() {
                let _ = sender.send(Envelope::Disconnected(self.id));
            }
        }

        let _ = self.sender.send(Envelope::Shutdown);
        if thread.join().is_err() {
            debug!(id = self.id, "Delivery thread panicked");
        }
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        self.stop();
    }
}

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::Debug;
use std::hash::Hash;

pub type ProtocolName = Cow<'static, str>;

/// A named message with an opaque payload. Decoding the payload is up to the
/// listener registered for that name.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub name: ProtocolName,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(name: impl Into<ProtocolName>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

pub trait NetworkService {
    type PeerId: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;
}

/// Outbound half of a transport.
pub trait MessageService: NetworkService + Send + Sync {
    /// Send a message to a single connected peer.
    fn notify(&self, peer: &Self::PeerId, message: Message) -> Result<(), Self::Error>;

    /// Send a message to every connected peer.
    fn broadcast(&self, message: Message) -> Result<(), Self::Error>;
}

/// Inbound half of a transport. Callbacks are invoked from the transport's
/// own thread, one at a time per transport.
pub trait Listener<PeerId>: Send + Sync {
    fn on_connect(&self, peer: PeerId);
    fn on_message(&self, peer: PeerId, message: Message);
    fn on_disconnect(&self, _peer: PeerId) {}
}

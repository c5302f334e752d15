//! Network plumbing for the blockchain framework.
//!
//! The rest of the node only sees [`MessageService`] for outbound traffic
//! and implements [`Listener`] for inbound traffic. [`memory`] wires peers
//! together inside one process, [`libp2p`] talks to the real network.

mod service;

pub mod libp2p;
pub mod memory;

pub use crate::service::{Listener, Message, MessageService, NetworkService, ProtocolName};

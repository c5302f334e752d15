//! A minimal proof-of-work node.
//!
//! [`Chain`] owns the block tree and picks the head. [`SeekNBuild`] fetches
//! whatever the chain is missing and feeds blocks into it. [`Miner`] extends
//! the head and restarts whenever it moves. [`ProtocolRouter`] connects all
//! of them to a [`blocknet`] transport, and [`Cryptonet`] wires everything
//! together from a [`Config`].

mod block;
mod chain;
mod config;
mod error;
mod hash;
mod miner;
mod node;
mod seek;

pub mod messages;
pub mod router;
pub mod standard;

#[cfg(test)]
mod testing;

pub use crate::block::{Block, ValidationError};
pub use crate::chain::{Acceptance, Chain, HeadObserver};
pub use crate::config::{ChainConfig, Config, RouterConfig, SeekConfig};
pub use crate::error::{ChainError, Error, RouterError};
pub use crate::hash::Hash;
pub use crate::miner::{Miner, MinerHandle, MinerState};
pub use crate::node::Cryptonet;
pub use crate::router::{Misbehaviour, Permissive, ProtocolRouter};
pub use crate::seek::{Priority, SeekNBuild};

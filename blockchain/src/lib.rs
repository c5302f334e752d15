//! General block framework.

#![warn(missing_docs)]

mod block;
mod chain;
pub mod memory;
mod store;

pub use crate::block::Identified;
pub use crate::chain::{ForkTree, ForkTreeMut};
pub use crate::store::{Store, StoreError};

use blockchain::memory::{MemoryForkTreeInsertError, MemoryForkTreeQueryError};
use blockchain::StoreError;
use thiserror::Error;

use crate::{Hash, ValidationError};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid block: {0}")]
    Validation(#[from] ValidationError),
    #[error("block {0} not found")]
    NotFound(Hash),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("fork tree query failed: {0}")]
    Query(#[from] MemoryForkTreeQueryError),
    #[error("fork tree insert failed: {0}")]
    Insert(#[from] MemoryForkTreeInsertError),
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("undecodable {name} payload: {source}")]
    Decode {
        name: &'static str,
        source: serde_json::Error,
    },
    #[error("failed to encode {name} payload: {source}")]
    Encode {
        name: &'static str,
        source: serde_json::Error,
    },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

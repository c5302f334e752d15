//! Wire payloads. Each is JSON inside a [`blocknet::Message`] named after it.

use blocknet::Message;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Hash, RouterError};

pub const INTRO: &str = "intro";
pub const BLOCKS: &str = "blocks";
pub const REQUEST_BLOCKS: &str = "request_blocks";

pub trait Payload: Serialize + DeserializeOwned {
    const NAME: &'static str;

    fn to_message(&self) -> Result<Message, RouterError> {
        serde_json::to_vec(self)
            .map(|payload| Message::new(Self::NAME, payload))
            .map_err(|source| RouterError::Encode {
                name: Self::NAME,
                source,
            })
    }

    fn decode(payload: &[u8]) -> Result<Self, RouterError> {
        serde_json::from_slice(payload).map_err(|source| RouterError::Decode {
            name: Self::NAME,
            source,
        })
    }
}

/// A peer's announcement of its head.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intro {
    pub top_block: Hash,
}

impl Payload for Intro {
    const NAME: &'static str = INTRO;
}

/// Serialized blocks, parents before children where the sender knows the
/// order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockList(pub Vec<Vec<u8>>);

impl Payload for BlockList {
    const NAME: &'static str = BLOCKS;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashList(pub Vec<Hash>);

impl Payload for HashList {
    const NAME: &'static str = REQUEST_BLOCKS;
}

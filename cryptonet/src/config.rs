use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Block, Error};

/// Node configuration. Every component receives its section at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run the miner after startup.
    pub mine: bool,
    pub miner_threads: usize,
    /// Hex encoded serialized genesis block. When absent, one is mined at
    /// startup.
    pub genesis: Option<String>,
    /// Log every protocol message at `info` instead of `debug`.
    pub network_debug: bool,
    pub chain: ChainConfig,
    pub seek: SeekConfig,
    pub router: RouterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mine: false,
            miner_threads: 1,
            genesis: None,
            network_debug: false,
            chain: ChainConfig::default(),
            seek: SeekConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Decode the configured genesis, if any.
    pub fn genesis_block<B: Block>(&self) -> Result<Option<B>, Error> {
        let Some(encoded) = &self.genesis else {
            return Ok(None);
        };

        let bytes = hex::decode(encoded)
            .map_err(|e| Error::Configuration(format!("genesis is not hex: {}", e)))?;
        B::deserialize(&bytes)
            .map(Some)
            .map_err(|e| Error::Configuration(format!("invalid genesis: {}", e)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Orphans kept while waiting for their parent. Oldest are evicted first.
    pub max_orphans: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self { max_orphans: 1024 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekConfig {
    /// Longest the fetch loop sleeps when nothing wakes it.
    pub tick_ms: u64,
    /// Unanswered requests are sent again after this long.
    pub request_timeout_ms: u64,
    /// Hashes per `request_blocks` message.
    pub max_batch: usize,
    /// Sends before a request is abandoned.
    pub max_attempts: u32,
}

impl SeekConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SeekConfig {
    fn default() -> Self {
        Self {
            tick_ms: 250,
            request_timeout_ms: 2000,
            max_batch: 128,
            max_attempts: 16,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Blocks served per `request_blocks` message.
    pub max_response_blocks: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_response_blocks: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::standard::StandardBlock;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{ "mine": true, "seek": { "max_batch": 8 } }"#).unwrap();
        assert!(config.mine);
        assert_eq!(config.miner_threads, 1);
        assert_eq!(config.seek.max_batch, 8);
        assert_eq!(config.seek.tick(), Duration::from_millis(250));
        assert_eq!(config.chain.max_orphans, 1024);
    }

    #[test]
    fn genesis_must_decode() {
        let mut config = Config::default();
        assert!(config.genesis_block::<StandardBlock>().unwrap().is_none());

        config.genesis = Some("zz".into());
        assert!(matches!(
            config.genesis_block::<StandardBlock>(),
            Err(Error::Configuration(_))
        ));

        config.genesis = Some(hex::encode(b"{}"));
        assert!(matches!(
            config.genesis_block::<StandardBlock>(),
            Err(Error::Configuration(_))
        ));
    }
}

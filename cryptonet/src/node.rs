use blockchain::{Identified, Store};
use blocknet::{Listener, MessageService};
use std::sync::Arc;
use tracing::info;

use crate::router::{Misbehaviour, Permissive, ProtocolRouter};
use crate::{Block, Chain, Config, Error, Miner, SeekNBuild};

/// A complete node: chain, synchronization, miner and protocol router built
/// from one [`Config`].
pub struct Cryptonet<B: Block, T: MessageService> {
    config: Config,
    chain: Arc<Chain<B>>,
    seek: Arc<SeekNBuild<B, T>>,
    miner: Miner<B, T>,
    router: Arc<ProtocolRouter<B, T>>,
}

impl<B: Block, T: MessageService + 'static> Cryptonet<B, T> {
    pub fn new(config: Config, transport: Arc<T>, store: Arc<dyn Store>) -> Result<Self, Error> {
        Self::with_penalty(config, transport, store, Arc::new(Permissive::default()))
    }

    /// Like [`Cryptonet::new`] with a custom policy for misbehaving peers.
    ///
    /// Without a configured genesis one is mined before this returns.
    pub fn with_penalty(
        config: Config,
        transport: Arc<T>,
        store: Arc<dyn Store>,
        penalty: Arc<dyn Misbehaviour<T::PeerId>>,
    ) -> Result<Self, Error> {
        let chain = Arc::new(Chain::new(config.chain.clone(), store));
        let seek = Arc::new(SeekNBuild::new(
            chain.clone(),
            transport.clone(),
            config.seek.clone(),
        )?);
        let miner = Miner::new(seek.clone(), config.miner_threads);

        let genesis = match config.genesis_block::<B>()? {
            Some(genesis) => genesis,
            None => miner
                .mine_genesis()
                .ok_or_else(|| Error::Configuration("genesis mining was interrupted".into()))?,
        };
        chain.set_genesis(genesis)?;
        chain.subscribe(Arc::new(miner.handle()));

        let router = Arc::new(ProtocolRouter::new(
            seek.clone(),
            transport,
            config.router.clone(),
            config.network_debug,
            penalty,
        ));

        Ok(Self {
            config,
            chain,
            seek,
            miner,
            router,
        })
    }

    /// Inbound side of the node, to be handed to the transport.
    pub fn listener(&self) -> Arc<dyn Listener<T::PeerId>> {
        self.router.clone()
    }

    /// Start mining if configured to.
    pub fn run(&self) -> Result<(), Error> {
        info!(genesis = ?self.chain.genesis_hash(), mine = self.config.mine, "Node running");
        if self.config.mine {
            self.miner.run()?;
        }
        Ok(())
    }
}

impl<B: Block, T: MessageService> Cryptonet<B, T> {
    pub fn chain(&self) -> &Arc<Chain<B>> {
        &self.chain
    }

    pub fn seek(&self) -> &Arc<SeekNBuild<B, T>> {
        &self.seek
    }

    pub fn miner(&self) -> &Miner<B, T> {
        &self.miner
    }

    pub fn router(&self) -> &Arc<ProtocolRouter<B, T>> {
        &self.router
    }

    /// Stop the miner, then synchronization. Accepted blocks stay in the
    /// chain and its store.
    pub fn shutdown(&self) {
        self.miner.shutdown();
        self.seek.shutdown();
        if let Ok(head) = self.chain.head() {
            info!(hash = %head.id(), height = head.height(), "Node stopped");
        }
    }
}

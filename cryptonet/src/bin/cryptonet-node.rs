use blockchain::memory::MemoryStore;
use blocknet::libp2p::{Config as NetworkConfig, Multiaddr, Worker};
use clap::Parser;
use cryptonet::standard::StandardBlock;
use cryptonet::{Block, Config, Cryptonet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "cryptonet-node")]
struct Cli {
    /// JSON configuration file. Flags below override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to listen on
    #[arg(short, long, default_value = "/ip4/0.0.0.0/tcp/63656")]
    listen: Multiaddr,
    /// Peer to dial at startup, may be repeated
    #[arg(long = "seed")]
    seeds: Vec<Multiaddr>,
    /// Mine on top of the best chain
    #[arg(long)]
    mine: bool,
    /// Hex encoded genesis block. Mined at startup when absent.
    #[arg(long)]
    genesis: Option<String>,
    /// Disable local peer discovery
    #[arg(long)]
    no_mdns: bool,
    /// Log every protocol message
    #[arg(long)]
    network_debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    config.mine |= cli.mine;
    config.network_debug |= cli.network_debug;
    if cli.genesis.is_some() {
        config.genesis = cli.genesis;
    }

    let (worker, service) = Worker::new(NetworkConfig {
        listen: cli.listen,
        seeds: cli.seeds,
        enable_mdns: !cli.no_mdns,
        ..Default::default()
    })?;

    let transport = Arc::new(service.clone());
    let node = tokio::task::spawn_blocking(move || {
        Cryptonet::<StandardBlock, _>::new(config, transport, Arc::new(MemoryStore::new()))
    })
    .await??;
    let node = Arc::new(node);

    if let Some(genesis) = node.chain().genesis_hash() {
        let encoded = hex::encode(node.chain().get_block(&genesis)?.serialize());
        info!(%genesis, "Share --genesis {} with other nodes", encoded);
    }

    let network = tokio::spawn(worker.run(node.listener()));
    node.run()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    service.shutdown();
    match network.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Network worker failed: {}", e),
        Err(e) => warn!("Network worker panicked: {}", e),
    }

    let stopping = node.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;
    Ok(())
}

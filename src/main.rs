use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use ringfs::crypto;
use ringfs::identity::Node;
use ringfs::{Peer, PeerConfig};

#[derive(Parser, Debug)]
#[command(name = "ringfs")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind and advertise.
    #[arg(short, long, default_value = "127.0.0.1:3000")]
    addr: String,

    /// Directory for key files and stored blobs.
    #[arg(short, long, default_value = "./.ringfs")]
    data_path: PathBuf,

    /// Address of a known peer to join through.
    #[arg(long)]
    peer_addr: Option<String>,

    /// PEM public key file of the known peer.
    #[arg(long)]
    peer_key: Option<PathBuf>,

    /// Connection queue capacity.
    #[arg(long, default_value_t = ringfs::server::DEFAULT_QUEUE_CAPACITY)]
    queue: usize,

    /// Number of request workers.
    #[arg(long, default_value_t = ringfs::server::DEFAULT_WORKERS)]
    workers: usize,

    /// Seconds between stabilization rounds.
    #[arg(long, default_value = "10")]
    stabilize_interval: u64,

    /// Periodically look up a fixed key and log its owner.
    #[arg(long)]
    probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let bootstrap = match (&args.peer_addr, &args.peer_key) {
        (Some(addr), Some(key_path)) => {
            let key = crypto::read_public_key_pem(key_path)
                .await
                .context("failed to read bootstrap peer key")?;
            Some(Node::from_addr(addr, crypto::WirePublicKey::from(&key)))
        }
        (Some(_), None) | (None, Some(_)) => {
            anyhow::bail!("--peer-addr and --peer-key must be given together")
        }
        (None, None) => None,
    };

    let mut config = PeerConfig::new(args.addr, args.data_path);
    config.bootstrap = bootstrap;
    config.queue_capacity = args.queue;
    config.workers = args.workers;
    config.stabilize_interval = std::time::Duration::from_secs(args.stabilize_interval);
    config.probe = args.probe;

    let peer = Peer::start(config).await?;
    info!(node = %peer.node(), "serving; ctrl-c to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, exiting gracefully"),
        Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
    }
    peer.shutdown().await;
    Ok(())
}

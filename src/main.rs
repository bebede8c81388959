use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use lodestore::provider::StoreOptions;
use lodestore::publisher::PublishMeta;
use lodestore::{Contact, Node, NodeConfig, NodeId, Strategy};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: String,
    id: NodeId,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must be ADDR/NODE_ID (64 hex chars)")?;
        let id = NodeId::from_hex(id_part).context("invalid node id hex")?;
        Ok(BootstrapPeer {
            addr: addr.to_string(),
            id,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "lodestore")]
#[command(author, version, about = "Decentralized content-addressed artifact store")]
struct Cli {
    /// Storage root (identity, chunks, metadata).
    #[arg(long, default_value = "./lodestore-data")]
    root: PathBuf,

    /// Provider strategy: local-only, network-only, p2p-only, hybrid.
    #[arg(long, default_value = "local-only")]
    strategy: String,

    /// Address advertised to peers.
    #[arg(long, default_value = "127.0.0.1:4100")]
    listen: String,

    /// Bootstrap peers as ADDR/NODE_ID. Repeatable.
    #[arg(long)]
    bootstrap: Vec<BootstrapPeer>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until interrupted, logging periodic status.
    Run,
    /// Publish a file and print its artifact id.
    Publish {
        file: PathBuf,
        /// Discovery tags. Repeatable.
        #[arg(long)]
        tag: Vec<String>,
        /// Content type for the discovery index.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Retrieve an artifact into a file.
    Retrieve { id: String, out: PathBuf },
}

fn build_node(cli: &Cli) -> Result<Node> {
    let strategy: Strategy = cli
        .strategy
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let config = NodeConfig {
        strategy,
        storage_root: cli.root.clone(),
        listen_addr: cli.listen.clone(),
        ..NodeConfig::default()
    };
    let seeds = cli
        .bootstrap
        .iter()
        .map(|peer| Contact::single(peer.id, peer.addr.clone()))
        .collect();
    Ok(Node::builder().config(config).bootstrap(seeds).build())
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let node = build_node(&cli)?;
    node.start().await?;
    info!(id = %node.id().await?, "lodestore node up");

    match &cli.command {
        Command::Run => {
            let mut status = time::interval(Duration::from_secs(30));
            status.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = status.tick() => {
                        let dht = node.dht_stats().await?;
                        info!(peers = dht.peers, values = dht.values, "status");
                    }
                }
            }
        }
        Command::Publish {
            file,
            tag,
            content_type,
        } => {
            let bytes = std::fs::read(file)
                .with_context(|| format!("reading {}", file.display()))?;
            let meta = PublishMeta {
                name: file.file_name().map(|n| n.to_string_lossy().to_string()),
                content_type: content_type.clone(),
                tags: tag.clone(),
                ..PublishMeta::default()
            };
            let record = node
                .publish_content(&bytes, meta, StoreOptions::default())
                .await?;
            println!("{}", record.metadata.id);
        }
        Command::Retrieve { id, out } => {
            let (bytes, record) = node.retrieve_content(id).await?;
            std::fs::write(out, &bytes)
                .with_context(|| format!("writing {}", out.display()))?;
            info!(
                id = %record.metadata.id,
                size = bytes.len(),
                "artifact retrieved and verified"
            );
        }
    }

    node.stop().await?;
    Ok(())
}

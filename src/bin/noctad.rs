//! noctad — the nocta network daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;

use nocta_node::{Node, NodeConfig};

const USAGE: &str = "\
noctad [options]

Options:
  --config <path>     TOML configuration file
  --network <name>    mainnet | testnet | regtest
  --listen <addr>     P2P listen address (host:port)
  --peer <addr>       add an outbound peer (repeatable)
  --help              print this help
";

fn parse_args() -> Result<NodeConfig> {
    let mut config_path: Option<PathBuf> = None;
    let mut network: Option<String> = None;
    let mut listen: Option<SocketAddr> = None;
    let mut peers: Vec<SocketAddr> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(value));
            }
            "--network" => network = Some(args.next().context("--network needs a name")?),
            "--listen" => {
                let value = args.next().context("--listen needs an address")?;
                listen = Some(value.parse().context("bad --listen address")?);
            }
            "--peer" => {
                let value = args.next().context("--peer needs an address")?;
                peers.push(value.parse().context("bad --peer address")?);
            }
            "--help" | "-h" => {
                print!("{USAGE}");
                std::process::exit(0);
            }
            other => bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }

    let mut config = match config_path {
        Some(path) => NodeConfig::load_file(&path)?,
        None => NodeConfig::default(),
    };
    if let Some(network) = network {
        config.network = network;
    }
    if let Some(listen) = listen {
        config.listen_addr = Some(listen);
    }
    if !peers.is_empty() {
        config.seed_peers = peers;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = parse_args()?;
    info!(
        network = %config.network,
        peers = config.seed_peers.len(),
        "noctad starting"
    );
    let node = Node::new(config)?;
    node.run().await
}

//! Node configuration: network parameters, sync tunables, and the
//! TOML-backed [`NodeConfig`] the binary loads at startup.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::primitives::{BlockTemplate, Hash, Height};

/// P2P protocol version this node speaks. The downloader only pulls
/// from peers advertising the same version.
pub const P2P_VERSION: u32 = 1;

/// Genesis coinbase blob, shared by all networks.
const GENESIS_COINBASE_HEX: &str =
    "010a01ff0001ffffffffffff0f029b2e4c0281c0b02e7c53291a94d1d0cbff8883f8024f5142ee494ffbbd088071";

/// Per-network chain constants.
#[derive(Clone, Debug)]
pub struct NetworkParams {
    pub name: &'static str,
    /// First bytes of every wire envelope.
    pub magic: [u8; 4],
    pub default_port: u16,
    pub genesis: BlockTemplate,
    pub genesis_bid: Hash,
    /// Heights at or below this are checkpointed: PoW verification is
    /// skipped for them during sync.
    pub checkpoint_height: Height,
    /// Fixed PoW target (hash as 256-bit LE integer must not exceed it).
    pub pow_target: Hash,
}

impl NetworkParams {
    pub fn for_network(name: &str) -> Result<Self> {
        match name {
            "mainnet" => Ok(Self::with(
                "mainnet",
                [0x4e, 0x4f, 0x43, 0x54],
                12020,
                1_527_638_400,
                340_000,
                // ~24 leading zero bits.
                target_with_prefix(&[0xff, 0xff, 0xff, 0x00]),
            )),
            "testnet" => Ok(Self::with(
                "testnet",
                [0x4e, 0x4f, 0x43, 0x74],
                12120,
                1_527_638_401,
                0,
                target_with_prefix(&[0xff, 0xff, 0xff, 0xff, 0x0f]),
            )),
            "regtest" => Ok(Self::regtest()),
            other => bail!("unknown network {other:?}"),
        }
    }

    /// Permissive parameters for tests: every hash passes the target
    /// and nothing is checkpointed.
    pub fn regtest() -> Self {
        Self::with(
            "regtest",
            [0x4e, 0x4f, 0x43, 0x72],
            12220,
            1_527_638_402,
            0,
            Hash([0xff; 32]),
        )
    }

    fn with(
        name: &'static str,
        magic: [u8; 4],
        default_port: u16,
        genesis_timestamp: u64,
        checkpoint_height: Height,
        pow_target: Hash,
    ) -> Self {
        let genesis = BlockTemplate {
            major_version: 1,
            minor_version: 0,
            timestamp: genesis_timestamp,
            previous_block_hash: Hash::ZERO,
            nonce: 70,
            coinbase: hex::decode(GENESIS_COINBASE_HEX).expect("genesis coinbase constant"),
            transaction_hashes: Vec::new(),
        };
        let genesis_bid = genesis.hash();
        Self {
            name,
            magic,
            default_port,
            genesis,
            genesis_bid,
            checkpoint_height,
            pow_target,
        }
    }
}

/// Sync tunables. The download budget constants were hardcoded in older
/// nodes of this family; they are exposed here so operators can adapt
/// them to their bandwidth.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Round-trip allowance for one chain or object request, seconds.
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    /// Cap on blocks simultaneously in flight across all peers.
    #[serde(default = "default_download_blocks")]
    pub download_blocks: usize,
    /// Cap on queued download cells (in flight + awaiting drain).
    #[serde(default = "default_download_window")]
    pub download_window: usize,
    /// PoW verification worker threads. 0 picks
    /// `max(2, available_parallelism / 2)`; hyperthread siblings buy
    /// nothing for this workload.
    #[serde(default)]
    pub pow_threads: usize,
}

fn default_sync_timeout_secs() -> u64 {
    20
}

fn default_download_blocks() -> usize {
    400
}

fn default_download_window() -> usize {
    2000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_timeout_secs: default_sync_timeout_secs(),
            download_blocks: default_download_blocks(),
            download_window: default_download_window(),
            pow_threads: 0,
        }
    }
}

impl SyncConfig {
    pub fn resolved_pow_threads(&self) -> usize {
        if self.pow_threads != 0 {
            return self.pow_threads;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        (cores / 2).max(2)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default = "default_network")]
    pub network: String,
    /// P2P listen address. None disables inbound connections.
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
    /// Outbound connection targets.
    #[serde(default)]
    pub seed_peers: Vec<SocketAddr>,
    #[serde(default = "default_max_outbound")]
    pub max_outbound: usize,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_network() -> String {
    "mainnet".to_string()
}

fn default_max_outbound() -> usize {
    8
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            listen_addr: None,
            seed_peers: Vec::new(),
            max_outbound: default_max_outbound(),
            sync: SyncConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: NodeConfig =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        NetworkParams::for_network(&self.network)?;
        if self.sync.sync_timeout_secs == 0 {
            bail!("sync_timeout_secs must be nonzero");
        }
        if self.sync.download_blocks == 0 || self.sync.download_window == 0 {
            bail!("download budgets must be nonzero");
        }
        if self.sync.download_blocks > self.sync.download_window {
            bail!(
                "download_blocks ({}) cannot exceed download_window ({})",
                self.sync.download_blocks,
                self.sync.download_window
            );
        }
        Ok(())
    }

    pub fn params(&self) -> Result<NetworkParams> {
        NetworkParams::for_network(&self.network)
    }
}

fn target_with_prefix(prefix: &[u8]) -> Hash {
    // LE integer: the low bytes are permissive, the top bytes zero.
    let mut target = Hash::ZERO;
    target.0[..prefix.len()].copy_from_slice(prefix);
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networks_have_distinct_genesis() {
        let mainnet = NetworkParams::for_network("mainnet").unwrap();
        let testnet = NetworkParams::for_network("testnet").unwrap();
        assert_ne!(mainnet.genesis_bid, testnet.genesis_bid);
        assert_ne!(mainnet.magic, testnet.magic);
    }

    #[test]
    fn unknown_network_rejected() {
        assert!(NetworkParams::for_network("betanet").is_err());
        let config = NodeConfig {
            network: "betanet".into(),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn budget_validation() {
        let mut config = NodeConfig::default();
        config.sync.download_blocks = 500;
        config.sync.download_window = 400;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_with_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
network = "testnet"
seed_peers = ["10.0.0.1:12120"]

[sync]
download_blocks = 100
"#,
        )
        .unwrap();
        assert_eq!(config.network, "testnet");
        assert_eq!(config.sync.download_blocks, 100);
        assert_eq!(config.sync.download_window, 2000);
        assert_eq!(config.sync.sync_timeout_secs, 20);
    }

    #[test]
    fn pow_thread_resolution() {
        let mut sync = SyncConfig::default();
        assert!(sync.resolved_pow_threads() >= 2);
        sync.pow_threads = 3;
        assert_eq!(sync.resolved_pow_threads(), 3);
    }
}

//! Shared harness for downloader integration tests: channel-backed fake
//! peers and helpers for building real block chains in memory.

use tokio::sync::mpsc;

use nocta_node::config::{NetworkParams, P2P_VERSION};
use nocta_node::network::peer::{Direction, PeerCommand, PeerId, PeerLink};
use nocta_node::network::protocol::{Message, SyncData};
use nocta_node::primitives::{BlockTemplate, Hash, PreparedBlock, RawBlock};
use nocta_node::BlockChain;

pub const MAGIC: [u8; 4] = [0x4e, 0x4f, 0x43, 0x72];

/// A peer the downloader talks to through its command channel. The
/// test inspects what was sent and simulates deliveries.
pub struct FakePeer {
    pub link: PeerLink,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
}

impl FakePeer {
    pub fn new(id: PeerId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = format!("10.1.0.{id}:12220").parse().unwrap();
        Self {
            link: PeerLink::new(id, addr, Direction::Outbound, P2P_VERSION, tx),
            commands: rx,
        }
    }

    pub fn id(&self) -> PeerId {
        self.link.id()
    }

    /// Drain the command channel into decoded messages and a
    /// disconnect flag.
    pub fn take_traffic(&mut self) -> Traffic {
        let mut messages = Vec::new();
        let mut disconnected = false;
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                PeerCommand::Send(frame) => messages.push(decode_frame(&frame)),
                PeerCommand::Disconnect(_) => disconnected = true,
            }
        }
        Traffic {
            messages,
            disconnected,
        }
    }
}

pub struct Traffic {
    pub messages: Vec<Message>,
    pub disconnected: bool,
}

impl Traffic {
    /// Block ids requested via get-objects, in request order.
    pub fn requested_blocks(&self) -> Vec<Hash> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::RequestGetObjects { blocks } => Some(blocks.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn chain_requests(&self) -> Vec<Vec<Hash>> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::RequestChain { block_ids } => Some(block_ids.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Decode a wire frame back into its protocol message.
pub fn decode_frame(frame: &[u8]) -> Message {
    assert_eq!(&frame[..4], &MAGIC, "frame magic");
    let id = u32::from_le_bytes(frame[4..8].try_into().unwrap());
    let len = u32::from_le_bytes(frame[9..13].try_into().unwrap()) as usize;
    Message::decode(id, &frame[13..13 + len]).expect("well-formed frame")
}

pub fn sync_data(top_id: Hash, current_height: u64) -> SyncData {
    SyncData {
        top_id,
        current_height,
    }
}

/// Build `count` blocks extending `parent`, chained together.
pub fn build_blocks(parent: Hash, count: usize) -> Vec<PreparedBlock> {
    let mut blocks = Vec::with_capacity(count);
    let mut prev = parent;
    for i in 0..count {
        let template = BlockTemplate {
            major_version: 1,
            minor_version: 0,
            timestamp: 1_600_000_000 + i as u64,
            previous_block_hash: prev,
            nonce: i as u32,
            coinbase: vec![0x01, i as u8],
            transaction_hashes: Vec::new(),
        };
        let raw = RawBlock {
            block: template.encode(),
            transactions: Vec::new(),
        };
        let pb = PreparedBlock::from_raw(raw, None).expect("valid block");
        prev = pb.bid;
        blocks.push(pb);
    }
    blocks
}

/// A regtest chain store plus `count` pre-built blocks that extend its
/// genesis but are not yet applied.
pub fn chain_with_pending(count: usize) -> (BlockChain, Vec<PreparedBlock>) {
    let chain = BlockChain::new(NetworkParams::regtest());
    let blocks = build_blocks(chain.genesis_bid(), count);
    (chain, blocks)
}

/// Same, but with a deep checkpoint zone so applying blocks never
/// touches the slow hash.
pub fn checkpointed_chain_with_pending(count: usize) -> (BlockChain, Vec<PreparedBlock>) {
    let mut params = NetworkParams::regtest();
    params.checkpoint_height = 1_000_000;
    let chain = BlockChain::new(params);
    let blocks = build_blocks(chain.genesis_bid(), count);
    (chain, blocks)
}

/// Apply the first `n` of `blocks` to the chain.
pub fn apply_blocks(chain: &mut BlockChain, blocks: &[PreparedBlock], n: usize) {
    for pb in &blocks[..n] {
        let result = chain.add_block(pb);
        assert!(
            matches!(
                result,
                nocta_node::AddBlockResult::Added | nocta_node::AddBlockResult::BroadcastAll
            ),
            "setup block rejected: {result:?}"
        );
    }
}

/// Chain response payload: common ancestor first, then the new ids.
pub fn chain_response(chain: &BlockChain, blocks: &[PreparedBlock]) -> (u64, Vec<Hash>) {
    let mut ids = vec![chain.tip_bid()];
    ids.extend(blocks.iter().map(|b| b.bid));
    (chain.tip_height(), ids)
}

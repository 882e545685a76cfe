//! The chain store the downloader feeds.
//!
//! Blocks are applied strictly in tip order; the store keeps a
//! height-indexed main chain and a bid index. Side chains and reorgs
//! are handled upstream of this subsystem and are rejected here.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::config::NetworkParams;
use crate::pow::{meets_target, PowContext};
use crate::primitives::{BlockTemplate, Hash, Height, PreparedBlock};

/// How a submitted block was received. `BroadcastAll` marks a fresh
/// tip extension worth relaying to peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddBlockResult {
    Added,
    BroadcastAll,
    AlreadyKnown,
    Orphan,
    Ban,
}

/// A block is relay-worthy when its timestamp is this close to now.
const BROADCAST_WINDOW_SECS: u64 = 2 * 60 * 60;

pub struct BlockChain {
    params: NetworkParams,
    /// Main chain, `chain[height] = bid`.
    chain: Vec<Hash>,
    index: HashMap<Hash, Height>,
    templates: HashMap<Hash, BlockTemplate>,
    /// Tip height known to a previous bulk import; the downloader stays
    /// quiet until the chain catches up to it.
    import_known_height: Height,
    /// Fallback PoW verification when a prepared block carries no hash
    /// (single-core prepare path).
    pow: PowContext,
}

impl BlockChain {
    pub fn new(params: NetworkParams) -> Self {
        let genesis_bid = params.genesis_bid;
        let genesis = params.genesis.clone();
        Self {
            params,
            chain: vec![genesis_bid],
            index: HashMap::from([(genesis_bid, 0)]),
            templates: HashMap::from([(genesis_bid, genesis)]),
            import_known_height: 0,
            pow: PowContext::new(),
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn tip_bid(&self) -> Hash {
        *self.chain.last().expect("chain never empty")
    }

    pub fn tip_height(&self) -> Height {
        (self.chain.len() - 1) as Height
    }

    pub fn genesis_bid(&self) -> Hash {
        self.params.genesis_bid
    }

    pub fn has_block(&self, bid: &Hash) -> bool {
        self.index.contains_key(bid)
    }

    pub fn template(&self, bid: &Hash) -> Option<&BlockTemplate> {
        self.templates.get(bid)
    }

    pub fn height_of(&self, bid: &Hash) -> Option<Height> {
        self.index.get(bid).copied()
    }

    /// Main-chain ids starting at `from`, capped at `max` entries.
    pub fn main_chain_ids(&self, from: Height, max: usize) -> Vec<Hash> {
        let start = from as usize;
        if start >= self.chain.len() {
            return Vec::new();
        }
        let end = self.chain.len().min(start + max);
        self.chain[start..end].to_vec()
    }

    pub fn is_in_checkpoint_zone(&self, height: Height) -> bool {
        height <= self.params.checkpoint_height
    }

    pub fn internal_import_known_height(&self) -> Height {
        self.import_known_height
    }

    pub fn set_internal_import_known_height(&mut self, height: Height) {
        self.import_known_height = height;
    }

    /// Locator with exponentially increasing gaps, tip first, genesis
    /// last. Lets a remote find the best common ancestor in one round
    /// trip.
    pub fn sparse_chain(&self) -> Vec<Hash> {
        let mut ids = Vec::new();
        let mut step: usize = 1;
        let mut height = self.tip_height() as usize;
        loop {
            ids.push(self.chain[height]);
            if height == 0 {
                return ids;
            }
            if ids.len() >= 10 {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }
    }

    pub fn add_block(&mut self, pb: &PreparedBlock) -> AddBlockResult {
        if self.index.contains_key(&pb.bid) {
            return AddBlockResult::AlreadyKnown;
        }
        if pb.template.previous_block_hash != self.tip_bid() {
            return AddBlockResult::Orphan;
        }
        let height = self.tip_height() + 1;
        let pow_hash = match pb.pow_hash {
            Some(hash) => Some(hash),
            // Checkpointed heights are trusted; everything else gets
            // verified here if the preparer did not.
            None if self.is_in_checkpoint_zone(height) => None,
            None => Some(self.pow.slow_hash(&pb.raw.block)),
        };
        if let Some(hash) = pow_hash {
            if !meets_target(&hash, &self.params.pow_target) {
                debug!(height, bid = %pb.bid, "PoW below target");
                return AddBlockResult::Ban;
            }
        }

        self.chain.push(pb.bid);
        self.index.insert(pb.bid, height);
        self.templates.insert(pb.bid, pb.template.clone());

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if pb.template.timestamp + BROADCAST_WINDOW_SECS > now {
            AddBlockResult::BroadcastAll
        } else {
            AddBlockResult::Added
        }
    }
}

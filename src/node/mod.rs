//! Node orchestration: wires the chain store, the downloader, and the
//! network layer together on one event loop.

pub mod downloader;
pub mod preparer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{NetworkParams, NodeConfig, P2P_VERSION};
use crate::network::peer::{PeerId, PeerLink};
use crate::network::peer_db::PeerDb;
use crate::network::protocol::{Message, SyncData, MAX_CHAIN_IDS};
use crate::network::{NetEvent, NetworkManager};
use crate::node::downloader::Downloader;
use crate::node::preparer::Preparer;
use crate::primitives::RawBlock;
use crate::storage::BlockChain;

/// Timed-sync cadence: how often we push our chain summary to peers.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

pub struct Node {
    events: mpsc::UnboundedReceiver<NetEvent>,
    worker_wake: Arc<Notify>,
    network: NetworkManager,
    core: NodeCore,
}

/// The event-loop-owned half of the node. Everything in here is
/// mutated from exactly one task.
struct NodeCore {
    config: NodeConfig,
    params: NetworkParams,
    chain: BlockChain,
    downloader: Downloader,
    /// Every live connection, inbound included, for serving requests
    /// and timed sync.
    peers: HashMap<PeerId, PeerLink>,
    peer_db: Arc<Mutex<PeerDb>>,
    tip_tx: watch::Sender<SyncData>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let params = config.params()?;
        let chain = BlockChain::new(params.clone());
        let peer_db = Arc::new(Mutex::new(PeerDb::new()));
        let (event_tx, events) = mpsc::unbounded_channel();
        let (tip_tx, tip_rx) = watch::channel(SyncData {
            top_id: chain.tip_bid(),
            current_height: chain.tip_height(),
        });
        let network = NetworkManager::new(params.magic, event_tx, tip_rx, Arc::clone(&peer_db));
        let worker_wake = Arc::new(Notify::new());
        let preparer = Preparer::new(
            config.sync.resolved_pow_threads(),
            Arc::clone(&worker_wake),
        );
        let downloader = Downloader::new(
            config.sync.clone(),
            params.magic,
            Arc::clone(&peer_db),
            Some(preparer),
        );
        Ok(Self {
            events,
            worker_wake,
            network,
            core: NodeCore {
                config,
                params,
                chain,
                downloader,
                peers: HashMap::new(),
                peer_db,
                tip_tx,
            },
        })
    }

    /// Long-poll surface: resolves whenever the tip advances.
    pub fn tip_watch(&self) -> watch::Receiver<SyncData> {
        self.core.tip_tx.subscribe()
    }

    pub async fn run(self) -> Result<()> {
        let Node {
            mut events,
            worker_wake,
            network,
            mut core,
        } = self;

        info!(
            network = core.params.name,
            tip = %core.chain.tip_bid(),
            "starting node"
        );
        if let Some(listen) = core.config.listen_addr {
            network.spawn_listener(listen);
        }
        if !core.config.seed_peers.is_empty() {
            network.spawn_connector(core.config.seed_peers.clone(), core.config.max_outbound);
        }

        let sync_timeout = Duration::from_secs(core.config.sync.sync_timeout_secs);
        // Several ticks per SYNC_TIMEOUT keep head-of-line checks fresh.
        let mut download_tick = tokio::time::interval(sync_timeout / 8);
        download_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let chain_deadline = core.downloader.chain_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => core.handle_net_event(event),
                    None => break,
                },
                _ = download_tick.tick() => core.downloader.on_download_timer(),
                _ = status_tick.tick() => core.broadcast_status(),
                _ = worker_wake.notified() => core.run_idle(&worker_wake),
                _ = sleep_until_opt(chain_deadline) => core.downloader.on_chain_timer(),
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl NodeCore {
    fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected { link, sync } => {
                info!(
                    peer = %link.address(),
                    incoming = link.is_incoming(),
                    height = sync.current_height,
                    "peer connected"
                );
                self.peer_db
                    .lock()
                    .expect("peer db lock")
                    .note_good_session(link.address());
                self.peers.insert(link.id(), link.clone());
                self.downloader.on_connect(link, sync, &mut self.chain);
            }
            NetEvent::Disconnected { peer } => {
                if let Some(link) = self.peers.remove(&peer) {
                    info!(peer = %link.address(), "peer disconnected");
                }
                self.downloader.on_disconnect(peer, &mut self.chain);
            }
            NetEvent::Message { peer, message } => self.handle_message(peer, message),
        }
        self.publish_tip();
    }

    fn handle_message(&mut self, peer: PeerId, message: Message) {
        match message {
            Message::Status { sync, .. } => {
                self.downloader.on_sync_data(peer, sync, &mut self.chain);
            }
            Message::RequestChain { block_ids } => self.serve_chain(peer, &block_ids),
            Message::ResponseChain {
                start_height,
                block_ids,
            } => {
                self.downloader
                    .on_chain_response(peer, start_height, block_ids, &mut self.chain);
            }
            Message::RequestGetObjects { blocks } => self.serve_objects(peer, &blocks),
            Message::ResponseGetObjects { blocks } => {
                // Only registered download peers may push blocks at us.
                if self.downloader.in_flight_of(peer).is_none() {
                    if let Some(link) = self.peers.get(&peer) {
                        debug!(peer = %link.address(), "objects from non-download peer");
                        link.disconnect("unsolicited objects");
                    }
                    return;
                }
                self.downloader
                    .on_objects_response(peer, blocks, &mut self.chain);
            }
            Message::RequestTxPool => {
                // No mempool in this node; nothing to push.
                debug!(peer, "tx pool requested");
            }
        }
    }

    /// Answer a locator with our main-chain ids from the best common
    /// ancestor forward. The common block itself is included, so a
    /// one-id response means the requester already has everything.
    fn serve_chain(&mut self, peer: PeerId, locator: &[crate::primitives::Hash]) {
        let Some(link) = self.peers.get(&peer) else {
            return;
        };
        let start_height = locator
            .iter()
            .find_map(|bid| self.chain.height_of(bid))
            .unwrap_or(0);
        let block_ids = self.chain.main_chain_ids(start_height, MAX_CHAIN_IDS);
        debug!(peer = %link.address(), start_height, count = block_ids.len(), "serving chain");
        let msg = Message::ResponseChain {
            start_height,
            block_ids,
        };
        link.send(msg.to_frame(self.params.magic));
    }

    fn serve_objects(&mut self, peer: PeerId, bids: &[crate::primitives::Hash]) {
        let Some(link) = self.peers.get(&peer) else {
            return;
        };
        let blocks: Vec<RawBlock> = bids
            .iter()
            .filter_map(|bid| self.chain.template(bid))
            .map(|template| RawBlock {
                block: template.encode(),
                transactions: Vec::new(),
            })
            .collect();
        debug!(peer = %link.address(), count = blocks.len(), "serving objects");
        link.send(Message::ResponseGetObjects { blocks }.to_frame(self.params.magic));
    }

    fn run_idle(&mut self, wake: &Notify) {
        let outcome = self.downloader.on_idle(&mut self.chain);
        if outcome.applied > 0 {
            self.publish_tip();
        }
        if outcome.head_ready {
            // More prepared blocks are waiting; take another idle pass
            // after the loop has had a chance to service other events.
            wake.notify_one();
        }
    }

    fn publish_tip(&self) {
        let current = SyncData {
            top_id: self.chain.tip_bid(),
            current_height: self.chain.tip_height(),
        };
        self.tip_tx.send_if_modified(|tip| {
            if *tip == current {
                false
            } else {
                *tip = current;
                true
            }
        });
    }

    /// Timed sync: push our chain summary to everyone and log catch-up
    /// progress while we are behind.
    fn broadcast_status(&self) {
        let status = Message::Status {
            version: P2P_VERSION,
            sync: SyncData {
                top_id: self.chain.tip_bid(),
                current_height: self.chain.tip_height(),
            },
        };
        let frame = status.to_frame(self.params.magic);
        for link in self.peers.values() {
            link.send(frame.clone());
        }
        let our_height = self.chain.tip_height();
        let known = self.downloader.known_block_count(our_height);
        if known > our_height {
            info!(
                height = our_height,
                known,
                in_flight = self.downloader.downloading_count(),
                queued = self.downloader.queue_len(),
                "sync progress"
            );
        }
    }
}

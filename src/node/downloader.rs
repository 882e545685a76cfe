//! Multi-peer block downloader.
//!
//! One instance lives on the node's event loop and owns all sync state:
//! which outbound peers may serve blocks, the pending chain of block
//! ids, the window of in-flight download cells, and the hand-off into
//! the PoW verification workers. Every external event (connect,
//! disconnect, chain response, objects response, timed sync, timers)
//! funnels into [`Downloader::advance_download`], which re-evaluates
//! the whole schedule; callbacks stay short and never loop back into
//! each other directly.
//!
//! Blocks reach the chain store in the exact order their ids were
//! promoted from the chain queue, no matter how network responses and
//! PoW completions interleave.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{SyncConfig, P2P_VERSION};
use crate::network::peer::{PeerId, PeerLink};
use crate::network::peer_db::PeerDb;
use crate::network::protocol::{Message, SyncData};
use crate::node::preparer::{PrepareJob, Preparer};
use crate::primitives::{BlockTemplate, Hash, Height, PreparedBlock, RawBlock};
use crate::storage::{AddBlockResult, BlockChain};

/// A peer this many blocks behind our tip is useless for sync.
const GOOD_LAG: Height = 5;
/// Idle drain yields back to the event loop after this long.
const DRAIN_SLICE: Duration = Duration::from_millis(100);
const LOG_THROTTLE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum CellStatus {
    Downloading,
    Downloaded,
    Preparing,
    Prepared,
}

/// One block in flight or queued, keyed by its position in the
/// download queue. Status only ever advances.
struct DownloadCell {
    bid: Hash,
    expected_height: Height,
    /// Address of the chain planner whose response advertised this id.
    bid_source: SocketAddr,
    status: CellStatus,
    downloading_client: Option<PeerId>,
    request_time: Instant,
    /// Once set, the owning peer survives slacker eviction in
    /// `advance_download`; only the download timer may still evict it.
    protect_from_disconnect: bool,
    rb: Option<RawBlock>,
    pb: Option<PreparedBlock>,
}

struct GoodPeer {
    link: PeerLink,
    sync: SyncData,
    /// Cells currently assigned to this peer.
    in_flight: usize,
}

/// Snapshot of the head download cell, for status surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadInfo {
    pub height: Height,
    pub assigned_to: Option<PeerId>,
    pub protected: bool,
}

/// What one idle pass accomplished.
pub struct IdleOutcome {
    pub applied: usize,
    /// Head cell is still prepared: caller should schedule another
    /// idle pass.
    pub head_ready: bool,
}

pub struct Downloader {
    config: SyncConfig,
    magic: [u8; 4],
    peer_db: Arc<Mutex<PeerDb>>,
    /// None runs the single-core path: blocks are prepared on the
    /// event loop and PoW is left to the chain store.
    preparer: Option<Preparer>,

    good_peers: HashMap<PeerId, GoodPeer>,
    total_downloading_blocks: usize,
    download_queue: VecDeque<DownloadCell>,

    chain_queue: VecDeque<Hash>,
    chain_start_height: Height,
    chain_source: Option<SocketAddr>,
    /// Peer with an outstanding chain request.
    chain_peer: Option<PeerId>,
    chain_deadline: Option<Instant>,

    /// Who delivered each of the last `download_blocks` blocks; the
    /// fairness weight for assignment.
    who_downloaded_block: VecDeque<PeerId>,

    log_request_at: Instant,
    log_response_at: Instant,
}

impl Downloader {
    pub fn new(
        config: SyncConfig,
        magic: [u8; 4],
        peer_db: Arc<Mutex<PeerDb>>,
        preparer: Option<Preparer>,
    ) -> Self {
        let now = Instant::now();
        Self {
            config,
            magic,
            peer_db,
            preparer,
            good_peers: HashMap::new(),
            total_downloading_blocks: 0,
            download_queue: VecDeque::new(),
            chain_queue: VecDeque::new(),
            chain_start_height: 0,
            chain_source: None,
            chain_peer: None,
            chain_deadline: None,
            who_downloaded_block: VecDeque::new(),
            log_request_at: now,
            log_response_at: now,
        }
    }

    fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.config.sync_timeout_secs)
    }

    /// Deadline of the outstanding chain request, if any. The event
    /// loop sleeps on this and calls [`Self::on_chain_timer`].
    pub fn chain_deadline(&self) -> Option<Instant> {
        self.chain_deadline
    }

    pub fn peer_count(&self) -> usize {
        self.good_peers.len()
    }

    pub fn downloading_count(&self) -> usize {
        self.total_downloading_blocks
    }

    pub fn queue_len(&self) -> usize {
        self.download_queue.len()
    }

    pub fn in_flight_of(&self, peer: PeerId) -> Option<usize> {
        self.good_peers.get(&peer).map(|e| e.in_flight)
    }

    pub fn chain_request_pending(&self) -> bool {
        self.chain_peer.is_some()
    }

    pub fn head_info(&self) -> Option<HeadInfo> {
        self.download_queue.front().map(|cell| HeadInfo {
            height: cell.expected_height,
            assigned_to: cell.downloading_client,
            protected: cell.protect_from_disconnect,
        })
    }

    /// Best chain height anyone we talk to has claimed, floored at
    /// `my`.
    pub fn known_block_count(&self, my: Height) -> Height {
        self.good_peers
            .values()
            .fold(my, |acc, e| acc.max(e.sync.current_height))
    }

    /// Never pull from incoming peers or protocol strangers; everyone
    /// else joins the registry with zero in-flight blocks.
    pub fn on_connect(&mut self, link: PeerLink, sync: SyncData, chain: &mut BlockChain) {
        if link.is_incoming() {
            return;
        }
        if link.version() != P2P_VERSION {
            debug!(peer = %link.address(), version = link.version(), "ignoring peer version");
            return;
        }
        trace!(peer = %link.address(), height = sync.current_height, "downloader on_connect");
        if sync.top_id == chain.tip_bid() {
            // Already at the same height; transactions can sync now
            // rather than after catch-up.
            link.send(Message::RequestTxPool.to_frame(self.magic));
        }
        self.good_peers.insert(link.id(), GoodPeer {
            link,
            sync,
            in_flight: 0,
        });
        self.advance_download(chain);
    }

    pub fn on_disconnect(&mut self, peer: PeerId, chain: &mut BlockChain) {
        let Some(entry) = self.good_peers.remove(&peer) else {
            return;
        };
        trace!(peer = %entry.link.address(), "downloader on_disconnect");
        assert!(
            self.total_downloading_blocks >= entry.in_flight,
            "total_downloading_blocks mismatch in disconnect"
        );
        self.total_downloading_blocks -= entry.in_flight;
        self.who_downloaded_block.retain(|id| *id != peer);
        for cell in self.download_queue.iter_mut() {
            if cell.status == CellStatus::Downloading && cell.downloading_client == Some(peer) {
                cell.downloading_client = None;
            }
        }
        if self.chain_peer == Some(peer) {
            self.chain_deadline = None;
            self.chain_peer = None;
            trace!("chain planner slot cleared by disconnect");
        }
        self.advance_download(chain);
    }

    /// Timed sync: refresh the peer's advertised chain summary.
    pub fn on_sync_data(&mut self, peer: PeerId, sync: SyncData, chain: &mut BlockChain) {
        if let Some(entry) = self.good_peers.get_mut(&peer) {
            entry.sync = sync;
        }
        self.advance_download(chain);
    }

    /// The chain request went unanswered for SYNC_TIMEOUT.
    pub fn on_chain_timer(&mut self) {
        self.chain_deadline = None;
        if let Some(peer) = self.chain_peer {
            if let Some(entry) = self.good_peers.get(&peer) {
                debug!(peer = %entry.link.address(), "chain request timed out");
                entry.link.disconnect("");
            }
        }
    }

    /// Second-chance eviction: a protected peer still sitting on the
    /// head cell past SYNC_TIMEOUT goes away. Runs every
    /// SYNC_TIMEOUT / 8.
    pub fn on_download_timer(&mut self) {
        let now = Instant::now();
        let Some(front) = self.download_queue.front() else {
            return;
        };
        if front.status != CellStatus::Downloading || !front.protect_from_disconnect {
            return;
        }
        let Some(client) = front.downloading_client else {
            return;
        };
        if now.saturating_duration_since(front.request_time) <= self.sync_timeout() {
            return;
        }
        if let Some(entry) = self.good_peers.get(&client) {
            let addr = entry.link.address();
            self.peer_db
                .lock()
                .expect("peer db lock")
                .delay_connection_attempt(addr, now);
            warn!(peer = %addr, "disconnecting protected slacker");
            entry.link.disconnect("");
        }
    }

    pub fn on_chain_response(
        &mut self,
        peer: PeerId,
        start_height: Height,
        block_ids: Vec<Hash>,
        chain: &mut BlockChain,
    ) {
        if self.chain_peer != Some(peer) || !self.chain_queue.is_empty() {
            // Chain we did not ask for. Candidate for banning.
            debug!(peer, "unsolicited chain response");
            return;
        }
        let (planner_addr, planner_link, planner_height) = match self.good_peers.get(&peer) {
            Some(entry) => (
                entry.link.address(),
                entry.link.clone(),
                entry.sync.current_height,
            ),
            None => return,
        };
        info!(
            peer = %planner_addr,
            start_height,
            length = block_ids.len(),
            "received chain"
        );
        self.chain_start_height = start_height;
        self.chain_source = Some(planner_addr);
        let last_received = block_ids.last().copied();
        self.chain_queue = block_ids.iter().copied().collect();

        let scheduled: HashSet<Hash> = self.download_queue.iter().map(|c| c.bid).collect();
        // Skip ids we already have or already scheduled. Stop at the
        // first novel id: later duplicates must keep their position,
        // blocks only apply in chain order.
        while let Some(front) = self.chain_queue.front() {
            if !chain.has_block(front) && !scheduled.contains(front) {
                break;
            }
            self.chain_queue.pop_front();
            self.chain_start_height += 1;
        }

        if self.chain_queue.is_empty() && block_ids.len() > 1 {
            if let Some(last) = last_received {
                if planner_height > chain.tip_height() + self.download_queue.len() as Height {
                    // Everything overlapped but the remote claims more:
                    // jump forward from the last id we were given.
                    info!(
                        peer = %planner_addr,
                        remote_height = planner_height,
                        our_height = chain.tip_height(),
                        from = %last,
                        "requesting more chain"
                    );
                    let msg = Message::RequestChain {
                        block_ids: vec![last, chain.genesis_bid()],
                    };
                    planner_link.send(msg.to_frame(self.magic));
                    self.chain_deadline = Some(Instant::now() + self.sync_timeout());
                    return;
                }
            }
        }
        if block_ids.len() != self.chain_queue.len() + 1 {
            debug!(length = self.chain_queue.len(), "truncated chain");
        }
        self.chain_peer = None;
        self.chain_deadline = None;
        self.advance_download(chain);
    }

    pub fn on_objects_response(
        &mut self,
        peer: PeerId,
        blocks: Vec<RawBlock>,
        chain: &mut BlockChain,
    ) {
        for raw in blocks {
            let template = match BlockTemplate::decode(&raw.block) {
                Ok(template) => template,
                Err(err) => {
                    if let Some(entry) = self.good_peers.get(&peer) {
                        warn!(peer = %entry.link.address(), %err, "unparseable block, banning");
                        entry.link.disconnect("");
                    }
                    break;
                }
            };
            let bid = template.hash();
            let position = self.download_queue.iter().position(|cell| {
                cell.status == CellStatus::Downloading
                    && cell.downloading_client == Some(peer)
                    && cell.bid == bid
            });
            let Some(position) = position else {
                if let Some(entry) = self.good_peers.get(&peer) {
                    warn!(peer = %entry.link.address(), %bid, "stray block, banning");
                    entry.link.disconnect("");
                }
                break;
            };

            let expected_height = {
                let cell = &mut self.download_queue[position];
                cell.status = CellStatus::Downloaded;
                cell.downloading_client = None;
                cell.rb = Some(raw);
                cell.expected_height
            };

            match self.good_peers.get_mut(&peer) {
                Some(entry) if entry.in_flight > 0 && self.total_downloading_blocks > 0 => {
                    entry.in_flight -= 1;
                    self.total_downloading_blocks -= 1;
                }
                _ => panic!("download cell references a peer with no in-flight blocks"),
            }
            self.who_downloaded_block.push_back(peer);

            let now = Instant::now();
            if now.saturating_duration_since(self.log_response_at) > LOG_THROTTLE {
                self.log_response_at = now;
                if let Some(entry) = self.good_peers.get(&peer) {
                    info!(
                        height = expected_height,
                        in_flight = self.total_downloading_blocks,
                        peer = %entry.link.address(),
                        "received block"
                    );
                }
            }

            let cell = &mut self.download_queue[position];
            let raw = cell.rb.take().expect("just stored");
            if let Some(preparer) = &self.preparer {
                cell.status = CellStatus::Preparing;
                preparer.add_work(PrepareJob {
                    bid,
                    verify_pow: !chain.is_in_checkpoint_zone(expected_height),
                    raw,
                    template,
                });
            } else {
                cell.pb = Some(PreparedBlock {
                    bid,
                    template,
                    raw,
                    pow_hash: None,
                });
                cell.status = CellStatus::Prepared;
            }
        }
        self.advance_download(chain);
    }

    /// Collect finished worker results, then drain prepared cells into
    /// the chain in strict order, bounded by the 100 ms slice so the
    /// event loop stays responsive.
    pub fn on_idle(&mut self, chain: &mut BlockChain) -> IdleOutcome {
        if let Some(preparer) = &self.preparer {
            let mut prepared = preparer.take_prepared();
            if !prepared.is_empty() {
                for cell in self.download_queue.iter_mut() {
                    if cell.status == CellStatus::Preparing {
                        if let Some(pb) = prepared.remove(&cell.bid) {
                            cell.pb = Some(pb);
                            cell.status = CellStatus::Prepared;
                        }
                    }
                }
            }
        }

        let drain_start = std::time::Instant::now();
        let mut applied = 0usize;
        while self
            .download_queue
            .front()
            .is_some_and(|cell| cell.status == CellStatus::Prepared)
        {
            let cell = self.download_queue.pop_front().expect("checked front");
            let pb = cell.pb.expect("prepared cell carries a block");
            match chain.add_block(&pb) {
                AddBlockResult::Ban => {
                    // The planner fed us a bad id. Its address is on the
                    // cell if we ever decide to ban it.
                    warn!(
                        height = cell.expected_height,
                        bid = %cell.bid,
                        source = %cell.bid_source,
                        "downloaded block failed verification"
                    );
                }
                AddBlockResult::Orphan => {
                    debug!(height = cell.expected_height, bid = %cell.bid, "orphan in download queue");
                }
                AddBlockResult::Added
                | AddBlockResult::BroadcastAll
                | AddBlockResult::AlreadyKnown => {}
            }
            applied += 1;
            if drain_start.elapsed() > DRAIN_SLICE {
                // Let other event-loop work run; the rest drains on the
                // next idle pass.
                break;
            }
        }

        if applied > 0 {
            self.advance_download(chain);
            if self.download_queue.is_empty() {
                let tip = chain.tip_bid();
                for entry in self.good_peers.values() {
                    if entry.sync.top_id == tip {
                        trace!(peer = %entry.link.address(), "starting transaction sync");
                        entry.link.send(Message::RequestTxPool.to_frame(self.magic));
                        break;
                    }
                }
            }
        }

        IdleOutcome {
            applied,
            head_ready: self
                .download_queue
                .front()
                .is_some_and(|cell| cell.status == CellStatus::Prepared),
        }
    }

    /// Reconciliation fixed point: promote ids to cells, re-plan the
    /// chain, assign unowned cells to peers, and evict slackers.
    /// Idempotent when no external event intervened.
    pub fn advance_download(&mut self, chain: &mut BlockChain) {
        if chain.tip_height() < chain.internal_import_known_height() {
            return;
        }
        let download_blocks = self.config.download_blocks;
        let download_window = self.config.download_window;

        while self.download_queue.len() < download_window && !self.chain_queue.is_empty() {
            let bid = self.chain_queue.pop_front().expect("checked non-empty");
            let bid_source = self.chain_source.expect("queued ids always have a source");
            self.download_queue.push_back(DownloadCell {
                bid,
                expected_height: self.chain_start_height,
                bid_source,
                status: CellStatus::Downloading,
                downloading_client: None,
                request_time: Instant::now(),
                protect_from_disconnect: false,
                rb: None,
                pb: None,
            });
            self.chain_start_height += 1;
        }
        self.advance_chain(chain);

        while self.who_downloaded_block.len() > download_blocks {
            self.who_downloaded_block.pop_front();
        }
        let mut downloaded_counter: HashMap<PeerId, usize> = HashMap::new();
        for id in &self.who_downloaded_block {
            *downloaded_counter.entry(*id).or_default() += 1;
        }

        let mut peer_order: Vec<PeerId> = self.good_peers.keys().copied().collect();
        peer_order.sort_unstable();
        let speed_cap = (download_blocks / 4).max(1);
        let now = Instant::now();

        for index in 0..self.download_queue.len() {
            {
                let cell = &self.download_queue[index];
                if cell.status != CellStatus::Downloading || cell.downloading_client.is_some() {
                    continue;
                }
            }
            if self.total_downloading_blocks >= download_blocks {
                break;
            }
            let expected_height = self.download_queue[index].expected_height;

            // Minimize in_flight / speed over peers that can serve this
            // height. The clamp keeps one dominant peer from absorbing
            // the whole window.
            let mut best: Option<(PeerId, usize, usize)> = None;
            for &id in &peer_order {
                let entry = &self.good_peers[&id];
                if entry.sync.current_height < expected_height {
                    continue;
                }
                let speed = downloaded_counter
                    .get(&id)
                    .copied()
                    .unwrap_or(0)
                    .clamp(1, speed_cap);
                let better = match best {
                    None => true,
                    Some((_, best_in_flight, best_speed)) => {
                        (entry.in_flight as u128) * (best_speed as u128)
                            < (best_in_flight as u128) * (speed as u128)
                    }
                };
                if better {
                    best = Some((id, entry.in_flight, speed));
                }
            }
            let Some((chosen, _, _)) = best else {
                // No peer can serve this height yet. A faster peer may
                // catch up; only a richer protocol fixes this properly.
                continue;
            };

            let bid = {
                let cell = &mut self.download_queue[index];
                cell.downloading_client = Some(chosen);
                cell.request_time = now;
                cell.bid
            };
            self.total_downloading_blocks += 1;
            let entry = self.good_peers.get_mut(&chosen).expect("chosen from registry");
            entry.in_flight += 1;
            if now.saturating_duration_since(self.log_request_at) > LOG_THROTTLE {
                self.log_request_at = now;
                info!(height = expected_height, peer = %entry.link.address(), "requesting block");
            }
            let msg = Message::RequestGetObjects { blocks: vec![bid] };
            entry.link.send(msg.to_frame(self.magic));
        }

        self.evict_slacker(now, download_blocks, download_window);
    }

    /// Two-stage slacker policy on the head cell. First strike marks
    /// every cell the peer owns as protected and disconnects it; a
    /// protected peer that still stalls is handled by
    /// [`Self::on_download_timer`].
    fn evict_slacker(&mut self, now: Instant, download_blocks: usize, download_window: usize) {
        let Some(front) = self.download_queue.front() else {
            return;
        };
        if front.status != CellStatus::Downloading
            || front.downloading_client.is_none()
            || front.protect_from_disconnect
        {
            return;
        }
        let bad_timeout = now.saturating_duration_since(front.request_time)
            > 2 * self.sync_timeout();
        let bad_relatively_slow = self.total_downloading_blocks < download_blocks
            && self.download_queue.len() >= download_window
            && self.good_peers.len() > 1;
        if !bad_timeout && !bad_relatively_slow {
            return;
        }
        let who = front.downloading_client.expect("checked above");
        if bad_timeout {
            warn!(
                height = front.expected_height,
                "head-of-line block request timed out"
            );
        }
        for cell in self.download_queue.iter_mut() {
            if cell.downloading_client == Some(who) {
                cell.protect_from_disconnect = true;
            }
        }
        if let Some(entry) = self.good_peers.get(&who) {
            let addr = entry.link.address();
            self.peer_db
                .lock()
                .expect("peer db lock")
                .delay_connection_attempt(addr, now);
            warn!(peer = %addr, "disconnecting slacker");
            entry.link.disconnect("");
        }
    }

    fn advance_chain(&mut self, chain: &mut BlockChain) {
        if self.chain_peer.is_some() || !self.chain_queue.is_empty() {
            return;
        }
        let tip_height = chain.tip_height();
        let mut peer_order: Vec<PeerId> = self.good_peers.keys().copied().collect();
        peer_order.sort_unstable();

        let mut lagging: Vec<PeerId> = Vec::new();
        let mut healthy: Vec<(Height, PeerId)> = Vec::new();
        for &id in &peer_order {
            let entry = &self.good_peers[&id];
            if entry.sync.current_height + GOOD_LAG < tip_height {
                lagging.push(id);
            } else {
                healthy.push((entry.sync.current_height, id));
            }
        }
        let now = Instant::now();
        if let Some(&id) = lagging.first() {
            let entry = &self.good_peers[&id];
            let addr = entry.link.address();
            self.peer_db
                .lock()
                .expect("peer db lock")
                .delay_connection_attempt(addr, now);
            info!(peer = %addr, "disconnecting lagging peer");
            // Reconciliation re-enters through the disconnect event.
            entry.link.disconnect("");
            return;
        }
        healthy.sort_unstable();
        let Some(&(best_height, best)) = healthy.last() else {
            return;
        };
        if best_height <= tip_height + self.download_queue.len() as Height {
            // Nothing to plan; when the queue empties we ask again.
            return;
        }
        self.chain_peer = Some(best);
        let entry = &self.good_peers[&best];
        info!(
            peer = %entry.link.address(),
            remote_height = best_height,
            our_height = tip_height,
            "requesting chain"
        );
        let msg = Message::RequestChain {
            block_ids: chain.sparse_chain(),
        };
        entry.link.send(msg.to_frame(self.magic));
        self.chain_deadline = Some(now + self.sync_timeout());
    }

    /// Cross-checks the bookkeeping the scheduler relies on. Cheap
    /// enough to run after every test step; a breach anywhere here is
    /// the fatal-error category of fault.
    pub fn assert_invariants(&self) {
        let assigned = self
            .download_queue
            .iter()
            .filter(|c| c.status == CellStatus::Downloading && c.downloading_client.is_some())
            .count();
        let registry_sum: usize = self.good_peers.values().map(|e| e.in_flight).sum();
        assert_eq!(registry_sum, self.total_downloading_blocks);
        assert_eq!(assigned, self.total_downloading_blocks);
        for window in self.download_queue.iter().zip(self.download_queue.iter().skip(1)) {
            assert_eq!(window.0.expected_height + 1, window.1.expected_height);
        }
        for cell in &self.download_queue {
            if let Some(client) = cell.downloading_client {
                assert!(
                    cell.status != CellStatus::Downloading
                        || self.good_peers.contains_key(&client),
                    "cell assigned to unregistered peer"
                );
            }
        }
    }
}

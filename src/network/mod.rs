//! P2P networking: connection lifecycle, framing, and the event stream
//! consumed by the node's event loop.

pub mod envelope;
pub mod peer;
pub mod peer_db;
pub mod protocol;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::P2P_VERSION;
use crate::network::peer::{run_connection, Direction, PeerId, PeerLink};
use crate::network::peer_db::PeerDb;
use crate::network::protocol::{Message, SyncData};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the event loop hears from the network.
#[derive(Debug)]
pub enum NetEvent {
    Connected { link: PeerLink, sync: SyncData },
    Disconnected { peer: PeerId },
    Message { peer: PeerId, message: Message },
}

/// Owns the accept loop and the outbound dialer. All per-connection
/// state lives in the spawned connection tasks; this struct only hands
/// out peer ids and knows which addresses are already dialed.
pub struct NetworkManager {
    magic: [u8; 4],
    events: mpsc::UnboundedSender<NetEvent>,
    next_id: Arc<AtomicU64>,
    /// Our chain summary, refreshed by the node, sent in handshakes.
    status: watch::Receiver<SyncData>,
    dialed: Arc<Mutex<HashSet<SocketAddr>>>,
    peer_db: Arc<Mutex<PeerDb>>,
}

impl NetworkManager {
    pub fn new(
        magic: [u8; 4],
        events: mpsc::UnboundedSender<NetEvent>,
        status: watch::Receiver<SyncData>,
        peer_db: Arc<Mutex<PeerDb>>,
    ) -> Self {
        Self {
            magic,
            events,
            next_id: Arc::new(AtomicU64::new(1)),
            status,
            dialed: Arc::new(Mutex::new(HashSet::new())),
            peer_db,
        }
    }

    pub fn spawn_listener(&self, addr: SocketAddr) {
        let magic = self.magic;
        let events = self.events.clone();
        let next_id = Arc::clone(&self.next_id);
        let status = self.status.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(%addr, "p2p listening");
                    listener
                }
                Err(err) => {
                    warn!(%addr, %err, "p2p bind failed");
                    return;
                }
            };
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        debug!(%err, "accept failed");
                        continue;
                    }
                };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let our_status = Message::Status {
                    version: P2P_VERSION,
                    sync: *status.borrow(),
                };
                let events = events.clone();
                tokio::spawn(run_connection(
                    stream,
                    remote,
                    Direction::Inbound,
                    id,
                    magic,
                    our_status,
                    events,
                ));
            }
        });
    }

    pub fn spawn_connector(&self, seeds: Vec<SocketAddr>, max_outbound: usize) {
        let magic = self.magic;
        let events = self.events.clone();
        let next_id = Arc::clone(&self.next_id);
        let status = self.status.clone();
        let dialed = Arc::clone(&self.dialed);
        let peer_db = Arc::clone(&self.peer_db);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DIAL_INTERVAL);
            loop {
                tick.tick().await;
                let now = Instant::now();
                for &addr in &seeds {
                    {
                        let dialed = dialed.lock().expect("dialed set lock");
                        if dialed.len() >= max_outbound || dialed.contains(&addr) {
                            continue;
                        }
                    }
                    if !peer_db
                        .lock()
                        .expect("peer db lock")
                        .is_connect_allowed(&addr, now)
                    {
                        continue;
                    }
                    dialed.lock().expect("dialed set lock").insert(addr);

                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    let our_status = Message::Status {
                        version: P2P_VERSION,
                        sync: *status.borrow(),
                    };
                    let events = events.clone();
                    let dialed = Arc::clone(&dialed);
                    tokio::spawn(async move {
                        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await
                        {
                            Ok(Ok(stream)) => {
                                run_connection(
                                    stream,
                                    addr,
                                    Direction::Outbound,
                                    id,
                                    magic,
                                    our_status,
                                    events,
                                )
                                .await;
                            }
                            Ok(Err(err)) => debug!(%addr, %err, "dial failed"),
                            Err(_) => debug!(%addr, "dial timed out"),
                        }
                        dialed.lock().expect("dialed set lock").remove(&addr);
                    });
                }
            }
        });
    }
}

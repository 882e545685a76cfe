//! Peer connections and the non-owning handles the rest of the node
//! holds on them.
//!
//! A [`PeerLink`] is id + address + a command channel into the
//! connection task. It never keeps a connection alive: when the task
//! dies the channel sends become no-ops, and the `Disconnected` event
//! is the single source of truth for peer lifetime.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::network::envelope::read_envelope;
use crate::network::protocol::Message;
use crate::network::NetEvent;

pub type PeerId = u64;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug)]
pub enum PeerCommand {
    Send(Bytes),
    Disconnect(String),
}

#[derive(Clone, Debug)]
pub struct PeerLink {
    id: PeerId,
    addr: SocketAddr,
    direction: Direction,
    version: u32,
    cmd: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerLink {
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        direction: Direction,
        version: u32,
        cmd: mpsc::UnboundedSender<PeerCommand>,
    ) -> Self {
        Self {
            id,
            addr,
            direction,
            version,
            cmd,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Best-effort enqueue on the connection's write buffer. Dropped
    /// silently if the connection already went away.
    pub fn send(&self, frame: Bytes) {
        let _ = self.cmd.send(PeerCommand::Send(frame));
    }

    pub fn disconnect(&self, reason: &str) {
        let _ = self.cmd.send(PeerCommand::Disconnect(reason.to_string()));
    }
}

/// Drive one TCP connection: handshake, then pump frames in and
/// commands out until either side gives up. Emits `Connected` after a
/// successful handshake and always emits `Disconnected` on exit paths
/// that follow it.
pub(crate) async fn run_connection(
    stream: TcpStream,
    addr: SocketAddr,
    direction: Direction,
    id: PeerId,
    magic: [u8; 4],
    our_status: Message,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Both sides open with a status message.
    if writer
        .write_all(&our_status.to_frame(magic))
        .await
        .is_err()
    {
        return;
    }
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_envelope(&mut reader, magic)).await;
    let (version, sync) = match first {
        Ok(Ok(env)) => match Message::decode(env.message_id, &env.payload) {
            Ok(Message::Status { version, sync }) => (version, sync),
            _ => {
                debug!(%addr, "handshake: expected status message");
                return;
            }
        },
        Ok(Err(err)) => {
            debug!(%addr, %err, "handshake read failed");
            return;
        }
        Err(_) => {
            debug!(%addr, "handshake timed out");
            return;
        }
    };

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let link = PeerLink::new(id, addr, direction, version, cmd_tx);
    if events
        .send(NetEvent::Connected { link, sync })
        .is_err()
    {
        return;
    }

    // Writes live on their own task: the read loop below must never be
    // cancelled in the middle of an envelope, so it cannot multiplex
    // with the command channel directly.
    let mut writer_task = tokio::spawn(async move {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                PeerCommand::Send(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                PeerCommand::Disconnect(reason) => {
                    if reason.is_empty() {
                        debug!(%addr, "disconnecting peer");
                    } else {
                        debug!(%addr, reason, "disconnecting peer");
                    }
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            envelope = read_envelope(&mut reader, magic) => match envelope {
                Ok(env) => match Message::decode(env.message_id, &env.payload) {
                    Ok(message) => {
                        if events.send(NetEvent::Message { peer: id, message }).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%addr, %err, "undecodable message, dropping peer");
                        break;
                    }
                },
                Err(err) => {
                    trace!(%addr, %err, "connection closed");
                    break;
                }
            },
            // Writer exiting means a disconnect was requested or the
            // socket died; abandoning a partial read is fine here, the
            // connection is over.
            _ = &mut writer_task => break,
        }
    }
    writer_task.abort();
    let _ = events.send(NetEvent::Disconnected { peer: id });
}

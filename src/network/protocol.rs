//! P2P protocol messages and their payload codecs.

use bytes::Bytes;

use crate::network::envelope::Envelope;
use crate::primitives::{DecodeError, Decoder, Encoder, Hash, Height, RawBlock};

/// Most ids one chain response may carry.
pub const MAX_CHAIN_IDS: usize = 10_000;
/// Most blocks one objects response may carry.
pub const MAX_OBJECT_BLOCKS: usize = 100;

pub const ID_STATUS: u32 = 1;
pub const ID_REQUEST_CHAIN: u32 = 2;
pub const ID_RESPONSE_CHAIN: u32 = 3;
pub const ID_REQUEST_GET_OBJECTS: u32 = 4;
pub const ID_RESPONSE_GET_OBJECTS: u32 = 5;
pub const ID_REQUEST_TX_POOL: u32 = 6;

/// A peer's view of its own chain, exchanged at handshake and refreshed
/// by periodic status messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncData {
    pub top_id: Hash,
    pub current_height: Height,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Handshake / timed sync: protocol version plus chain summary.
    Status { version: u32, sync: SyncData },
    /// Locator from the requester's side.
    RequestChain { block_ids: Vec<Hash> },
    /// Ids starting at `start_height`, running forward. The first id is
    /// the best common ancestor; a single-id response means the remote
    /// has nothing new relative to the locator.
    ResponseChain {
        start_height: Height,
        block_ids: Vec<Hash>,
    },
    RequestGetObjects { blocks: Vec<Hash> },
    ResponseGetObjects { blocks: Vec<RawBlock> },
    /// Ask the remote to push its transaction pool.
    RequestTxPool,
}

impl Message {
    pub fn id(&self) -> u32 {
        match self {
            Message::Status { .. } => ID_STATUS,
            Message::RequestChain { .. } => ID_REQUEST_CHAIN,
            Message::ResponseChain { .. } => ID_RESPONSE_CHAIN,
            Message::RequestGetObjects { .. } => ID_REQUEST_GET_OBJECTS,
            Message::ResponseGetObjects { .. } => ID_RESPONSE_GET_OBJECTS,
            Message::RequestTxPool => ID_REQUEST_TX_POOL,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::ResponseChain { .. } | Message::ResponseGetObjects { .. }
        )
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Message::Status { version, sync } => {
                enc.write_u32_le(*version);
                enc.write_hash(&sync.top_id);
                enc.write_u64_le(sync.current_height);
            }
            Message::RequestChain { block_ids } => write_hashes(&mut enc, block_ids),
            Message::ResponseChain {
                start_height,
                block_ids,
            } => {
                enc.write_u64_le(*start_height);
                write_hashes(&mut enc, block_ids);
            }
            Message::RequestGetObjects { blocks } => write_hashes(&mut enc, blocks),
            Message::ResponseGetObjects { blocks } => {
                enc.write_varint(blocks.len() as u64);
                for raw in blocks {
                    enc.write_var_bytes(&raw.block);
                    enc.write_varint(raw.transactions.len() as u64);
                    for tx in &raw.transactions {
                        enc.write_var_bytes(tx);
                    }
                }
            }
            Message::RequestTxPool => {}
        }
        enc.into_inner()
    }

    pub fn decode(message_id: u32, payload: &[u8]) -> Result<Message, DecodeError> {
        let mut dec = Decoder::new(payload);
        let message = match message_id {
            ID_STATUS => Message::Status {
                version: dec.read_u32_le()?,
                sync: SyncData {
                    top_id: dec.read_hash()?,
                    current_height: dec.read_u64_le()?,
                },
            },
            ID_REQUEST_CHAIN => Message::RequestChain {
                block_ids: read_hashes(&mut dec, MAX_CHAIN_IDS)?,
            },
            ID_RESPONSE_CHAIN => Message::ResponseChain {
                start_height: dec.read_u64_le()?,
                block_ids: read_hashes(&mut dec, MAX_CHAIN_IDS)?,
            },
            ID_REQUEST_GET_OBJECTS => Message::RequestGetObjects {
                blocks: read_hashes(&mut dec, MAX_OBJECT_BLOCKS)?,
            },
            ID_RESPONSE_GET_OBJECTS => {
                let count = dec.read_len()?;
                if count > MAX_OBJECT_BLOCKS {
                    return Err(DecodeError::OversizedCollection(count as u64));
                }
                let mut blocks = Vec::with_capacity(count);
                for _ in 0..count {
                    let block = dec.read_var_bytes()?;
                    let tx_count = dec.read_len()?;
                    // Each transaction blob costs at least one byte.
                    if tx_count > dec.remaining() {
                        return Err(DecodeError::OversizedCollection(tx_count as u64));
                    }
                    let mut transactions = Vec::with_capacity(tx_count);
                    for _ in 0..tx_count {
                        transactions.push(dec.read_var_bytes()?);
                    }
                    blocks.push(RawBlock {
                        block,
                        transactions,
                    });
                }
                Message::ResponseGetObjects { blocks }
            }
            ID_REQUEST_TX_POOL => Message::RequestTxPool,
            _ => return Err(DecodeError::Invalid("unknown message id")),
        };
        if !dec.is_empty() {
            return Err(DecodeError::Invalid("trailing bytes in payload"));
        }
        Ok(message)
    }

    /// Full wire frame for this message.
    pub fn to_frame(&self, magic: [u8; 4]) -> Bytes {
        Envelope {
            message_id: self.id(),
            is_response: self.is_response(),
            payload: self.encode_payload(),
        }
        .encode(magic)
    }
}

fn write_hashes(enc: &mut Encoder, hashes: &[Hash]) {
    enc.write_varint(hashes.len() as u64);
    for hash in hashes {
        enc.write_hash(hash);
    }
}

fn read_hashes(dec: &mut Decoder<'_>, max: usize) -> Result<Vec<Hash>, DecodeError> {
    let count = dec.read_len()?;
    if count > max {
        return Err(DecodeError::OversizedCollection(count as u64));
    }
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(dec.read_hash()?);
    }
    Ok(hashes)
}

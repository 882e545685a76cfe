//! Block template, raw wire form, and the prepared (verified) form
//! handed to the chain store.

use crate::pow::PowContext;
use crate::primitives::{sha256d, DecodeError, Decoder, Encoder, Hash};

/// Maximum transactions referenced by one block template.
const MAX_BLOCK_TX_COUNT: u64 = 100_000;

/// Parsed block header plus the body layout: the coinbase blob and the
/// hashes of all other transactions. This is what peers gossip; full
/// transaction bodies travel alongside in [`RawBlock::transactions`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTemplate {
    pub major_version: u8,
    pub minor_version: u8,
    pub timestamp: u64,
    pub previous_block_hash: Hash,
    pub nonce: u32,
    pub coinbase: Vec<u8>,
    pub transaction_hashes: Vec<Hash>,
}

impl BlockTemplate {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(data);
        let template = Self::decode_from(&mut dec)?;
        if !dec.is_empty() {
            return Err(DecodeError::Invalid("trailing bytes after block template"));
        }
        Ok(template)
    }

    pub fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let major_version = dec.read_u8()?;
        let minor_version = dec.read_u8()?;
        let timestamp = dec.read_u64_le()?;
        let previous_block_hash = dec.read_hash()?;
        let nonce = dec.read_u32_le()?;
        let coinbase = dec.read_var_bytes()?;
        let tx_count = dec.read_varint()?;
        if tx_count > MAX_BLOCK_TX_COUNT {
            return Err(DecodeError::OversizedCollection(tx_count));
        }
        let mut transaction_hashes = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            transaction_hashes.push(dec.read_hash()?);
        }
        Ok(Self {
            major_version,
            minor_version,
            timestamp,
            previous_block_hash,
            nonce,
            coinbase,
            transaction_hashes,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(64 + self.coinbase.len());
        enc.write_u8(self.major_version);
        enc.write_u8(self.minor_version);
        enc.write_u64_le(self.timestamp);
        enc.write_hash(&self.previous_block_hash);
        enc.write_u32_le(self.nonce);
        enc.write_var_bytes(&self.coinbase);
        enc.write_varint(self.transaction_hashes.len() as u64);
        for hash in &self.transaction_hashes {
            enc.write_hash(hash);
        }
        enc.into_inner()
    }

    /// Block id: double-sha256 of the canonical encoding. The same blob
    /// is the PoW input, so a template pins both identities at once.
    pub fn hash(&self) -> Hash {
        sha256d(&self.encode())
    }
}

/// A block as it travels on the wire: the template blob plus the full
/// transaction bodies the remote chose to attach.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawBlock {
    pub block: Vec<u8>,
    pub transactions: Vec<Vec<u8>>,
}

/// A parsed and (outside the checkpoint zone) PoW-verified block, ready
/// for [`crate::storage::BlockChain::add_block`].
#[derive(Clone, Debug)]
pub struct PreparedBlock {
    pub bid: Hash,
    pub template: BlockTemplate,
    pub raw: RawBlock,
    /// None when verification was skipped (checkpointed heights).
    pub pow_hash: Option<Hash>,
}

impl PreparedBlock {
    /// Parse a raw block and, when a PoW context is supplied, compute
    /// its slow hash. Mirrors the worker-pool job: pass `None` inside
    /// the checkpoint zone.
    pub fn from_raw(
        raw: RawBlock,
        pow: Option<&mut PowContext>,
    ) -> Result<Self, DecodeError> {
        let template = BlockTemplate::decode(&raw.block)?;
        let bid = template.hash();
        let pow_hash = pow.map(|ctx| ctx.slow_hash(&raw.block));
        Ok(Self {
            bid,
            template,
            raw,
            pow_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::sha256;

    fn sample_template() -> BlockTemplate {
        BlockTemplate {
            major_version: 1,
            minor_version: 0,
            timestamp: 1_530_000_000,
            previous_block_hash: sha256(b"parent"),
            nonce: 0x0102_0304,
            coinbase: vec![0x01, 0xff, 0x00],
            transaction_hashes: vec![sha256(b"tx0"), sha256(b"tx1")],
        }
    }

    #[test]
    fn template_codec_round_trip() {
        let template = sample_template();
        let decoded = BlockTemplate::decode(&template.encode()).unwrap();
        assert_eq!(decoded, template);
        assert_eq!(decoded.hash(), template.hash());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut blob = sample_template().encode();
        blob.push(0);
        assert!(matches!(
            BlockTemplate::decode(&blob),
            Err(DecodeError::Invalid(_))
        ));
    }

    #[test]
    fn prepared_block_bid_matches_template() {
        let template = sample_template();
        let raw = RawBlock {
            block: template.encode(),
            transactions: vec![vec![0xaa], vec![0xbb]],
        };
        let mut ctx = PowContext::new();
        let pb = PreparedBlock::from_raw(raw, Some(&mut ctx)).unwrap();
        assert_eq!(pb.bid, template.hash());
        assert!(pb.pow_hash.is_some());

        let raw = RawBlock {
            block: template.encode(),
            transactions: vec![],
        };
        let pb = PreparedBlock::from_raw(raw, None).unwrap();
        assert!(pb.pow_hash.is_none());
    }

    #[test]
    fn garbage_blob_fails_parse() {
        let raw = RawBlock {
            block: vec![1, 2, 3],
            transactions: vec![],
        };
        assert!(PreparedBlock::from_raw(raw, None).is_err());
    }
}

//! Wire envelope framing.
//!
//! Every message travels as `magic(4) | message_id(4) | flags(1) |
//! payload_len(4) | payload`, integers little-endian. The only flag bit
//! in use marks responses.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard cap on one message payload.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

const HEADER_SIZE: usize = 4 + 4 + 1 + 4;
const FLAG_RESPONSE: u8 = 0x01;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("payload of {0} bytes exceeds limit")]
    Oversized(u32),
    #[error("unknown flags {0:#x}")]
    UnknownFlags(u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: u32,
    pub is_response: bool,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self, magic: [u8; 4]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&magic);
        buf.put_u32_le(self.message_id);
        buf.put_u8(if self.is_response { FLAG_RESPONSE } else { 0 });
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Read one envelope off the stream. Cancel-safe only between
/// envelopes, which is how the connection task uses it.
pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
) -> Result<Envelope, EnvelopeError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    if header[..4] != magic {
        return Err(EnvelopeError::BadMagic(header[..4].try_into().unwrap()));
    }
    let message_id = u32::from_le_bytes(header[4..8].try_into().unwrap());
    let flags = header[8];
    if flags & !FLAG_RESPONSE != 0 {
        return Err(EnvelopeError::UnknownFlags(flags));
    }
    let len = u32::from_le_bytes(header[9..13].try_into().unwrap());
    if len as usize > MAX_PAYLOAD_SIZE {
        return Err(EnvelopeError::Oversized(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Envelope {
        message_id,
        is_response: flags & FLAG_RESPONSE != 0,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0x4e, 0x4f, 0x43, 0x72];

    #[tokio::test]
    async fn frame_round_trip() {
        let env = Envelope {
            message_id: 3,
            is_response: true,
            payload: vec![1, 2, 3, 4],
        };
        let frame = env.encode(MAGIC);
        let mut cursor = std::io::Cursor::new(frame.to_vec());
        let decoded = read_envelope(&mut cursor, MAGIC).await.unwrap();
        assert_eq!(decoded, env);
    }

    #[tokio::test]
    async fn wrong_magic_rejected() {
        let env = Envelope {
            message_id: 1,
            is_response: false,
            payload: vec![],
        };
        let frame = env.encode([0; 4]);
        let mut cursor = std::io::Cursor::new(frame.to_vec());
        assert!(matches!(
            read_envelope(&mut cursor, MAGIC).await,
            Err(EnvelopeError::BadMagic(_))
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let mut frame = Envelope {
            message_id: 1,
            is_response: false,
            payload: vec![],
        }
        .encode(MAGIC)
        .to_vec();
        frame[9..13].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(frame);
        assert!(matches!(
            read_envelope(&mut cursor, MAGIC).await,
            Err(EnvelopeError::Oversized(_))
        ));
    }
}

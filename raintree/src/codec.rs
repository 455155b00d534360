//! Envelope encoding.
//!
//! Envelopes are serialized with bincode. The stream framing used by the
//! TCP transport lives here too:
//!
//! ```text
//! [4 bytes: request nonce (u32-le)] [4 bytes: payload length (u32-le)] [N bytes: payload]
//! ```
//!
//! The receiver acknowledges a frame by echoing its 4-byte nonce.

use {
    crate::{
        envelope::Envelope,
        error::{RainTreeError, Result},
    },
    std::fmt::Debug,
};

/// Length of a frame header: request nonce plus payload length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Symmetric envelope codec.
pub trait Codec: Debug + Send + Sync + 'static {
    /// Serialize an envelope. Fails rather than produce an oversized frame.
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;
    /// Deserialize an envelope read off the wire.
    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// Bincode codec bounded by a maximum encoded size.
#[derive(Debug, Clone)]
pub struct BincodeCodec {
    max_message_size: usize,
}

impl BincodeCodec {
    /// Codec rejecting envelopes larger than `max_message_size` bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Codec for BincodeCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(envelope)?;
        if bytes.len() > self.max_message_size {
            return Err(RainTreeError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        if bytes.len() > self.max_message_size {
            return Err(RainTreeError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Prefix `payload` with the frame header.
pub fn frame(nonce: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN.saturating_add(payload.len()));
    buf.extend_from_slice(&nonce.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a frame header into `(nonce, payload length)`.
pub fn read_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> (u32, usize) {
    let [n0, n1, n2, n3, l0, l1, l2, l3] = *header;
    let nonce = u32::from_le_bytes([n0, n1, n2, n3]);
    let len = u32::from_le_bytes([l0, l1, l2, l3]) as usize;
    (nonce, len)
}

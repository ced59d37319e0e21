//! Message bundles and their wire codec.
//!
//! A bundle is the atomic unit on the wire: a group of messages drained from
//! one ring buffer at one moment, plus a 32-byte header carrying the
//! producer timestamp and the channel's message high-water mark. The framing
//! is big-endian and bit-exact:
//!
//! ```text
//! offset  size  field
//! 0       4     magic        = 0xBADC0FEE
//! 4       4     bundle_type  {1=Bundle, 2=Barrier, 3=Empty}
//! 8       8     last_message_id
//! 16      8     bundle_ts_ms
//! 24      4     message_count
//! 28      4     payload_len
//! 32      …     payload (message_count framed messages)
//! ```

use crate::error::{Result, TransferError};
use crate::message::{MessageType, StreamingMessage};

/// Magic number opening every bundle image.
pub const BUNDLE_MAGIC: u32 = 0xBADC_0FEE;

/// Fixed bundle header width.
pub const BUNDLE_HEADER_LEN: usize = 32;

/// Kind of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BundleType {
    /// One or more ordinary data messages.
    Bundle = 1,
    /// Exactly one barrier message.
    Barrier = 2,
    /// Header-only heartbeat; `last_message_id` carries the high-water mark.
    Empty = 3,
}

impl BundleType {
    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(Self::Bundle),
            2 => Ok(Self::Barrier),
            3 => Ok(Self::Empty),
            other => Err(TransferError::UnknownMessageType(other)),
        }
    }
}

/// Parsed bundle header.
///
/// The reader parses the header alone on every fetch; message payloads are
/// only materialized when the caller asks for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleMeta {
    pub bundle_type: BundleType,
    pub last_message_id: u64,
    pub bundle_ts_ms: u64,
    pub message_count: u32,
}

impl BundleMeta {
    /// Decodes the 32-byte header from the front of a wire image.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BUNDLE_HEADER_LEN {
            return Err(TransferError::Truncated {
                need: BUNDLE_HEADER_LEN,
                have: bytes.len(),
            });
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if magic != BUNDLE_MAGIC {
            return Err(TransferError::BadMagic(magic));
        }
        let bundle_type = BundleType::from_tag(u32::from_be_bytes(bytes[4..8].try_into().unwrap()))?;
        Ok(Self {
            bundle_type,
            last_message_id: u64::from_be_bytes(bytes[8..16].try_into().unwrap()),
            bundle_ts_ms: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
            message_count: u32::from_be_bytes(bytes[24..28].try_into().unwrap()),
        })
    }

    #[inline]
    pub fn is_barrier(&self) -> bool {
        self.bundle_type == BundleType::Barrier
    }

    #[inline]
    pub fn is_empty_bundle(&self) -> bool {
        self.bundle_type == BundleType::Empty
    }
}

/// A bundle with its messages materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBundle {
    pub meta: BundleMeta,
    pub messages: Vec<StreamingMessage>,
}

impl MessageBundle {
    /// Builds a bundle from drained messages.
    ///
    /// All messages must share one [`MessageType`]; the bundle type follows
    /// from it (a barrier message makes a Barrier bundle). `last_message_id`
    /// is the sequence id of the final message.
    pub fn from_messages(messages: Vec<StreamingMessage>, bundle_ts_ms: u64) -> Self {
        debug_assert!(!messages.is_empty(), "data bundle needs at least one message");
        debug_assert!(
            messages
                .windows(2)
                .all(|w| w[0].message_type == w[1].message_type),
            "bundle must not mix message types"
        );
        let bundle_type = match messages[0].message_type {
            MessageType::Message => BundleType::Bundle,
            MessageType::Barrier => BundleType::Barrier,
        };
        let meta = BundleMeta {
            bundle_type,
            last_message_id: messages.last().map_or(0, |m| m.seq_id),
            bundle_ts_ms,
            message_count: messages.len() as u32,
        };
        Self { meta, messages }
    }

    /// Builds a header-only heartbeat bundle carrying the channel's current
    /// message high-water mark.
    pub fn empty(last_message_id: u64, bundle_ts_ms: u64) -> Self {
        Self {
            meta: BundleMeta {
                bundle_type: BundleType::Empty,
                last_message_id,
                bundle_ts_ms,
                message_count: 0,
            },
            messages: Vec::new(),
        }
    }

    /// Total wire size of this bundle.
    pub fn encoded_len(&self) -> usize {
        BUNDLE_HEADER_LEN + self.payload_len()
    }

    fn payload_len(&self) -> usize {
        self.messages.iter().map(StreamingMessage::encoded_len).sum()
    }

    /// Writes the wire image into `out`, which must be exactly
    /// [`encoded_len`](Self::encoded_len) bytes.
    pub fn encode_into(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.encoded_len());
        let payload_len = self.payload_len() as u32;
        out[0..4].copy_from_slice(&BUNDLE_MAGIC.to_be_bytes());
        out[4..8].copy_from_slice(&(self.meta.bundle_type as u32).to_be_bytes());
        out[8..16].copy_from_slice(&self.meta.last_message_id.to_be_bytes());
        out[16..24].copy_from_slice(&self.meta.bundle_ts_ms.to_be_bytes());
        out[24..28].copy_from_slice(&self.meta.message_count.to_be_bytes());
        out[28..32].copy_from_slice(&payload_len.to_be_bytes());

        let mut payload = Vec::with_capacity(payload_len as usize);
        for message in &self.messages {
            message.encode_into(&mut payload);
        }
        out[BUNDLE_HEADER_LEN..].copy_from_slice(&payload);
    }

    /// Encodes into a freshly allocated buffer.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        self.encode_into(&mut out);
        out
    }

    /// Parses a full bundle, header and messages, from a wire image.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let meta = BundleMeta::decode(bytes)?;
        let payload_len = u32::from_be_bytes(bytes[28..32].try_into().unwrap()) as usize;
        let payload = &bytes[BUNDLE_HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(TransferError::LengthMismatch {
                declared: payload_len,
                actual: payload.len(),
            });
        }

        let mut messages = Vec::with_capacity(meta.message_count as usize);
        let mut cursor = 0;
        for _ in 0..meta.message_count {
            let (message, consumed) = StreamingMessage::decode(&payload[cursor..])?;
            messages.push(message);
            cursor += consumed;
        }
        if cursor != payload_len {
            return Err(TransferError::LengthMismatch {
                declared: payload_len,
                actual: cursor,
            });
        }
        Ok(Self { meta, messages })
    }
}

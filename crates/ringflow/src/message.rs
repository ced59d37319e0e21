//! Identifiers and the application message unit.
//!
//! A [`StreamingMessage`] is what the application hands to the writer on one
//! channel. Messages are immutable once created and move by ownership: the
//! ring buffer owns a pushed message until the writer loop drains it into a
//! bundle.

use crate::error::{Result, TransferError};
use rand::RngCore;
use std::fmt;

/// Width of channel and actor identifiers, in bytes.
pub const ID_LEN: usize = 20;

macro_rules! id_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Wraps a fixed-width byte array.
            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Parses an identifier from the front of a slice.
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                if bytes.len() < ID_LEN {
                    return Err(TransferError::Truncated {
                        need: ID_LEN,
                        have: bytes.len(),
                    });
                }
                let mut id = [0u8; ID_LEN];
                id.copy_from_slice(&bytes[..ID_LEN]);
                Ok(Self(id))
            }

            /// Generates a random identifier.
            pub fn random() -> Self {
                let mut id = [0u8; ID_LEN];
                rand::thread_rng().fill_bytes(&mut id);
                Self(id)
            }

            /// The all-zero identifier.
            pub const fn nil() -> Self {
                Self([0u8; ID_LEN])
            }

            /// Raw bytes of the identifier.
            #[inline]
            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

id_type!(
    ChannelId,
    "Identifier of one logical channel (queue) between a producer and a consumer actor."
);
id_type!(ActorId, "Identifier of one worker actor.");

impl ChannelId {
    /// Derives a per-item object id by mixing a sequence number into the
    /// trailing eight bytes. Used by the object-store channel backend.
    pub fn with_seq(&self, seq_id: u64) -> Self {
        let mut bytes = self.0;
        let tail = u64::from_be_bytes(bytes[ID_LEN - 8..].try_into().unwrap());
        bytes[ID_LEN - 8..].copy_from_slice(&tail.wrapping_add(seq_id).to_be_bytes());
        Self(bytes)
    }
}

/// Kind of an application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Ordinary data message.
    Message = 1,
    /// Checkpoint barrier, opaque to the transport. Barriers never share a
    /// bundle with ordinary messages.
    Barrier = 2,
}

impl MessageType {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::Message),
            2 => Ok(Self::Barrier),
            other => Err(TransferError::UnknownMessageType(u32::from(other))),
        }
    }
}

/// Framed message header width: `[4 total_size][1 type][8 seq_id]`.
pub const MESSAGE_HEADER_LEN: usize = 13;

/// One application message on one channel.
///
/// `seq_id` is assigned by the writer, monotonically from 1 per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingMessage {
    pub seq_id: u64,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl StreamingMessage {
    /// Creates a data message.
    pub fn new(seq_id: u64, message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            seq_id,
            message_type,
            payload,
        }
    }

    /// Total framed size of this message on the wire.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.payload.len()
    }

    /// Appends the framed image `[4 total_size][1 type][8 seq_id][payload]`
    /// (big-endian) to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.encoded_len() as u32).to_be_bytes());
        out.push(self.message_type as u8);
        out.extend_from_slice(&self.seq_id.to_be_bytes());
        out.extend_from_slice(&self.payload);
    }

    /// Decodes one framed message from the front of `bytes`, returning the
    /// message and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < MESSAGE_HEADER_LEN {
            return Err(TransferError::Truncated {
                need: MESSAGE_HEADER_LEN,
                have: bytes.len(),
            });
        }
        let total_size = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if total_size < MESSAGE_HEADER_LEN {
            return Err(TransferError::LengthMismatch {
                declared: total_size,
                actual: MESSAGE_HEADER_LEN,
            });
        }
        if bytes.len() < total_size {
            return Err(TransferError::Truncated {
                need: total_size,
                have: bytes.len(),
            });
        }
        let message_type = MessageType::from_tag(bytes[4])?;
        let seq_id = u64::from_be_bytes(bytes[5..13].try_into().unwrap());
        let payload = bytes[MESSAGE_HEADER_LEN..total_size].to_vec();
        Ok((
            Self {
                seq_id,
                message_type,
                payload,
            },
            total_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_hex_display() {
        let id = ChannelId::from_bytes([0xab; ID_LEN]);
        assert_eq!(id.to_string(), "ab".repeat(ID_LEN));
    }

    #[test]
    fn test_id_random_distinct() {
        assert_ne!(ChannelId::random(), ChannelId::random());
    }

    #[test]
    fn test_id_from_short_slice() {
        assert!(matches!(
            ActorId::from_slice(&[1, 2, 3]),
            Err(TransferError::Truncated { .. })
        ));
    }

    #[test]
    fn test_with_seq_changes_tail_only() {
        let id = ChannelId::from_bytes([7; ID_LEN]);
        let derived = id.with_seq(42);
        assert_ne!(id, derived);
        assert_eq!(id.as_bytes()[..ID_LEN - 8], derived.as_bytes()[..ID_LEN - 8]);
    }

    #[test]
    fn test_message_round_trip() {
        let msg = StreamingMessage::new(17, MessageType::Message, vec![1, 2, 3, 0xff]);
        let mut out = Vec::new();
        msg.encode_into(&mut out);
        assert_eq!(out.len(), msg.encoded_len());

        let (decoded, consumed) = StreamingMessage::decode(&out).unwrap();
        assert_eq!(consumed, out.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_decode_truncated() {
        let msg = StreamingMessage::new(1, MessageType::Barrier, vec![9; 8]);
        let mut out = Vec::new();
        msg.encode_into(&mut out);
        assert!(matches!(
            StreamingMessage::decode(&out[..out.len() - 1]),
            Err(TransferError::Truncated { .. })
        ));
    }

    #[test]
    fn test_message_decode_unknown_type() {
        let msg = StreamingMessage::new(1, MessageType::Message, vec![]);
        let mut out = Vec::new();
        msg.encode_into(&mut out);
        out[4] = 9;
        assert!(matches!(
            StreamingMessage::decode(&out),
            Err(TransferError::UnknownMessageType(9))
        ));
    }
}

//! Actor-to-actor queue protocol messages.
//!
//! Four message kinds flow between an upstream writer actor and a
//! downstream reader actor, all sharing one header:
//!
//! ```text
//! [4 magic][4 type][20 queue_id][20 actor_id][20 peer_actor_id]
//! ```
//!
//! - `Data`: a produced bundle image, downstream only.
//! - `Notification`: consumption watermark, upstream only.
//! - `Check`: handshake probe from upstream.
//! - `CheckRsp`: handshake reply, carried only on the synchronous call
//!   path. Receiving one through async dispatch is a protocol corruption.

use crate::error::{Result, TransferError};
use crate::message::{ActorId, ChannelId, ID_LEN};

/// Magic number opening every protocol message.
pub const PROTOCOL_MAGIC: u32 = 0xBADD_CAFE;

/// Shared header width.
pub const PROTOCOL_HEADER_LEN: usize = 8 + 3 * ID_LEN;

/// Handshake error codes carried by [`CheckRspMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueError {
    Ok = 0,
    QueueNotExist = 1,
}

impl QueueError {
    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::Ok),
            1 => Ok(Self::QueueNotExist),
            other => Err(TransferError::UnknownMessageType(other)),
        }
    }
}

/// Routing fields shared by every protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHeader {
    pub queue_id: ChannelId,
    pub actor_id: ActorId,
    pub peer_actor_id: ActorId,
}

/// A produced item pushed downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub header: PeerHeader,
    pub seq_id: u64,
    pub payload: Vec<u8>,
}

/// Consumption watermark pushed upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationMessage {
    pub header: PeerHeader,
    pub seq_id: u64,
}

/// Handshake probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckMessage {
    pub header: PeerHeader,
}

/// Handshake reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckRspMessage {
    pub header: PeerHeader,
    pub error: QueueError,
}

/// Any inbound protocol message, as produced by [`ProtocolMessage::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Data(DataMessage),
    Notification(NotificationMessage),
    Check(CheckMessage),
    CheckRsp(CheckRspMessage),
}

fn encode_header(out: &mut Vec<u8>, message_type: u32, header: &PeerHeader) {
    out.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    out.extend_from_slice(&message_type.to_be_bytes());
    out.extend_from_slice(header.queue_id.as_bytes());
    out.extend_from_slice(header.actor_id.as_bytes());
    out.extend_from_slice(header.peer_actor_id.as_bytes());
}

fn decode_header(bytes: &[u8]) -> Result<(u32, PeerHeader)> {
    if bytes.len() < PROTOCOL_HEADER_LEN {
        return Err(TransferError::Truncated {
            need: PROTOCOL_HEADER_LEN,
            have: bytes.len(),
        });
    }
    let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    if magic != PROTOCOL_MAGIC {
        return Err(TransferError::BadMagic(magic));
    }
    let message_type = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    let queue_id = ChannelId::from_slice(&bytes[8..8 + ID_LEN])?;
    let actor_id = ActorId::from_slice(&bytes[8 + ID_LEN..8 + 2 * ID_LEN])?;
    let peer_actor_id = ActorId::from_slice(&bytes[8 + 2 * ID_LEN..PROTOCOL_HEADER_LEN])?;
    Ok((
        message_type,
        PeerHeader {
            queue_id,
            actor_id,
            peer_actor_id,
        },
    ))
}

impl DataMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROTOCOL_HEADER_LEN + 12 + self.payload.len());
        encode_header(&mut out, 1, &self.header);
        out.extend_from_slice(&self.seq_id.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

impl NotificationMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROTOCOL_HEADER_LEN + 8);
        encode_header(&mut out, 2, &self.header);
        out.extend_from_slice(&self.seq_id.to_be_bytes());
        out
    }
}

impl CheckMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROTOCOL_HEADER_LEN);
        encode_header(&mut out, 3, &self.header);
        out
    }
}

impl CheckRspMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROTOCOL_HEADER_LEN + 4);
        encode_header(&mut out, 4, &self.header);
        out.extend_from_slice(&(self.error as u32).to_be_bytes());
        out
    }
}

impl ProtocolMessage {
    /// Parses any protocol message from its wire image.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (message_type, header) = decode_header(bytes)?;
        let body = &bytes[PROTOCOL_HEADER_LEN..];
        match message_type {
            1 => {
                if body.len() < 12 {
                    return Err(TransferError::Truncated {
                        need: 12,
                        have: body.len(),
                    });
                }
                let seq_id = u64::from_be_bytes(body[0..8].try_into().unwrap());
                let payload_len = u32::from_be_bytes(body[8..12].try_into().unwrap()) as usize;
                let payload = &body[12..];
                if payload.len() != payload_len {
                    return Err(TransferError::LengthMismatch {
                        declared: payload_len,
                        actual: payload.len(),
                    });
                }
                Ok(Self::Data(DataMessage {
                    header,
                    seq_id,
                    payload: payload.to_vec(),
                }))
            }
            2 => {
                if body.len() < 8 {
                    return Err(TransferError::Truncated {
                        need: 8,
                        have: body.len(),
                    });
                }
                Ok(Self::Notification(NotificationMessage {
                    header,
                    seq_id: u64::from_be_bytes(body[0..8].try_into().unwrap()),
                }))
            }
            3 => Ok(Self::Check(CheckMessage { header })),
            4 => {
                if body.len() < 4 {
                    return Err(TransferError::Truncated {
                        need: 4,
                        have: body.len(),
                    });
                }
                let error = QueueError::from_tag(u32::from_be_bytes(body[0..4].try_into().unwrap()))?;
                Ok(Self::CheckRsp(CheckRspMessage { header, error }))
            }
            other => Err(TransferError::UnknownMessageType(other)),
        }
    }

    /// Routing header of the message, whatever its kind.
    pub fn header(&self) -> &PeerHeader {
        match self {
            Self::Data(m) => &m.header,
            Self::Notification(m) => &m.header,
            Self::Check(m) => &m.header,
            Self::CheckRsp(m) => &m.header,
        }
    }
}

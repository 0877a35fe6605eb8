//! Replication Protocol
//!
//! Wire format between master and slaves. Every message travels as one
//! frame:
//!
//! ```text
//! | 8 bytes                       | length - 8 bytes |
//! | length (includes these bytes) | payload          |
//! ```
//!
//! The payload starts with an 8-byte tag. All integers are little-endian
//! `u64`.
//!
//! | tag | message          | fields after the tag                                  |
//! |-----|------------------|-------------------------------------------------------|
//! | 0   | JoinRequest      | tree len, tree, host len, host                        |
//! | 1   | JoinAccept       | host id, tree len, tree, registry len, registry       |
//! | 2   | UpdateBroadcast  | tree len, tree, registry len, registry                |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::registry::HostId;

const TAG_JOIN_REQUEST: u64 = 0;
const TAG_JOIN_ACCEPT: u64 = 1;
const TAG_UPDATE_BROADCAST: u64 = 2;

/// Protocol messages between master and slaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Slave offers its local tree and host record
    JoinRequest { tree: Bytes, host: Bytes },

    /// Master admits a slave and hands it the merged state
    JoinAccept {
        host_id: HostId,
        tree: Bytes,
        registry: Bytes,
    },

    /// Master pushes the merged state to joined slaves
    UpdateBroadcast { tree: Bytes, registry: Bytes },
}

impl Message {
    /// Encode the payload (everything after the length prefix)
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Message::JoinRequest { tree, host } => {
                dst.put_u64_le(TAG_JOIN_REQUEST);
                put_blob(dst, tree);
                put_blob(dst, host);
            }
            Message::JoinAccept {
                host_id,
                tree,
                registry,
            } => {
                dst.put_u64_le(TAG_JOIN_ACCEPT);
                dst.put_u64_le(*host_id);
                put_blob(dst, tree);
                put_blob(dst, registry);
            }
            Message::UpdateBroadcast { tree, registry } => {
                dst.put_u64_le(TAG_UPDATE_BROADCAST);
                put_blob(dst, tree);
                put_blob(dst, registry);
            }
        }
    }

    /// Size of the encoded payload
    pub fn encoded_len(&self) -> usize {
        let blobs = match self {
            Message::JoinRequest { tree, host } => 16 + tree.len() + host.len(),
            Message::JoinAccept { tree, registry, .. } => 24 + tree.len() + registry.len(),
            Message::UpdateBroadcast { tree, registry } => 16 + tree.len() + registry.len(),
        };
        8 + blobs
    }

    /// Decode a complete payload
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let tag = take_u64(&mut payload)?;
        let message = match tag {
            TAG_JOIN_REQUEST => Message::JoinRequest {
                tree: take_blob(&mut payload)?,
                host: take_blob(&mut payload)?,
            },
            TAG_JOIN_ACCEPT => Message::JoinAccept {
                host_id: take_u64(&mut payload)?,
                tree: take_blob(&mut payload)?,
                registry: take_blob(&mut payload)?,
            },
            TAG_UPDATE_BROADCAST => Message::UpdateBroadcast {
                tree: take_blob(&mut payload)?,
                registry: take_blob(&mut payload)?,
            },
            other => return Err(Error::Protocol(format!("unknown message tag {}", other))),
        };

        if payload.has_remaining() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after {}",
                payload.remaining(),
                message.type_name()
            )));
        }
        Ok(message)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::JoinRequest { .. } => "JoinRequest",
            Message::JoinAccept { .. } => "JoinAccept",
            Message::UpdateBroadcast { .. } => "UpdateBroadcast",
        }
    }
}

fn put_blob(dst: &mut BytesMut, blob: &[u8]) {
    dst.put_u64_le(blob.len() as u64);
    dst.put_slice(blob);
}

fn take_u64(src: &mut Bytes) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(Error::Protocol("truncated integer field".into()));
    }
    Ok(src.get_u64_le())
}

fn take_blob(src: &mut Bytes) -> Result<Bytes> {
    let len = take_u64(src)?;
    if len > src.remaining() as u64 {
        return Err(Error::Protocol(format!(
            "blob of {} bytes exceeds the {} bytes left",
            len,
            src.remaining()
        )));
    }
    Ok(src.split_to(len as usize))
}

/// Length prefix of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length, prefix included
    pub length: u64,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest frame accepted from the wire
    pub const MAX_FRAME: u64 = 1 << 30;

    /// Header for a payload of `payload_len` bytes, refusing frames the
    /// decoder would reject
    pub fn for_payload(payload_len: usize) -> Result<Self> {
        let length = payload_len as u64 + Self::SIZE as u64;
        if length > Self::MAX_FRAME {
            return Err(Error::Protocol(format!("frame length {} too large", length)));
        }
        Ok(Self { length })
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.length.to_le_bytes()
    }

    /// Deserialize header from bytes, rejecting impossible lengths
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self> {
        let length = u64::from_le_bytes(bytes);
        if length < Self::SIZE as u64 {
            return Err(Error::Protocol(format!("frame length {} below header size", length)));
        }
        if length > Self::MAX_FRAME {
            return Err(Error::Protocol(format!("frame length {} too large", length)));
        }
        Ok(Self { length })
    }
}

/// Frame codec for `tokio_util::codec::Framed`
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; FrameHeader::SIZE];
        prefix.copy_from_slice(&src[..FrameHeader::SIZE]);
        let header = FrameHeader::from_bytes(prefix)?;

        let total = header.length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(FrameHeader::SIZE);
        Message::decode(frame.freeze()).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let payload_len = message.encoded_len();
        let header = FrameHeader::for_payload(payload_len)?;
        dst.reserve(FrameHeader::SIZE + payload_len);
        dst.put_slice(&header.to_bytes());
        message.encode(dst);
        Ok(())
    }
}

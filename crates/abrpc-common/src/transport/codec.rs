//! Frame codec for the abrpc wire protocol.
//!
//! # Frame Layout
//!
//! ```text
//! +-------+-------+---------+--------------+-------------------+-----------------+
//! | 0xAB  | 0xBA  | VERSION | PAYLOAD_KIND | LENGTH (u32, BE)  | PAYLOAD         |
//! +-------+-------+---------+--------------+-------------------+-----------------+
//!   1 B     1 B      1 B         1 B              4 B             LENGTH bytes
//! ```
//!
//! `PAYLOAD_KIND` is the wire id of the serializer that produced the payload,
//! or [`HEARTBEAT_KIND`] for a heartbeat frame, which has no payload.
//!
//! Decoding never tears down a connection: malformed input is logged and
//! dropped, and the caller simply keeps reading.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::protocol::error::{AbrpcError, Result};
use crate::protocol::{Message, Request, Response};
use crate::transport::serializer::{JsonSerializer, MessageType, Serializer, SerializerRegistry};

/// Frame magic bytes.
pub const MAGIC: [u8; 2] = [0xAB, 0xBA];

/// Protocol version written into every frame.
pub const VERSION: u8 = 1;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// `PAYLOAD_KIND` value reserved for heartbeat frames.
pub const HEARTBEAT_KIND: u8 = 0xFF;

/// Maximum accepted payload length (10 MiB).
pub const MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

/// Which end of a connection owns the stream being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reads responses, writes requests.
    Client,
    /// Reads requests, writes responses.
    Server,
}

impl Role {
    fn inbound(self) -> MessageType {
        match self {
            Role::Client => MessageType::Response,
            Role::Server => MessageType::Request,
        }
    }
}

/// Encodes messages into frames and pulls complete frames out of a read buffer.
///
/// # Example
///
/// ```
/// use abrpc_common::transport::{FrameCodec, Role};
/// use abrpc_common::protocol::{Message, Request};
/// use bytes::BytesMut;
///
/// let client = FrameCodec::json(Role::Client);
/// let server = FrameCodec::json(Role::Server);
///
/// let request = Request::new("Echo", "ping", vec![]);
/// let mut buf = BytesMut::new();
/// client.encode(&Message::Request(request.clone()), &mut buf).unwrap();
///
/// assert_eq!(server.decode(&mut buf), Some(Message::Request(request)));
/// assert!(buf.is_empty());
/// ```
#[derive(Clone)]
pub struct FrameCodec {
    role: Role,
    registry: Arc<SerializerRegistry>,
    serializer: Arc<dyn Serializer>,
}

impl FrameCodec {
    /// Creates a codec that encodes with the serializer registered under `serializer_id`.
    ///
    /// Inbound frames are decoded with whichever registered serializer their
    /// header names, so peers may use different serializers.
    pub fn new(role: Role, registry: Arc<SerializerRegistry>, serializer_id: u8) -> Result<Self> {
        let serializer = registry
            .get(serializer_id)
            .ok_or_else(|| AbrpcError::UnknownSerializer(serializer_id.to_string()))?;
        Ok(Self { role, registry, serializer })
    }

    /// Creates a codec using the built-in JSON serializer.
    pub fn json(role: Role) -> Self {
        let registry = Arc::new(SerializerRegistry::new());
        let serializer = Arc::new(JsonSerializer);
        Self { role, registry, serializer }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn serializer_id(&self) -> u8 {
        self.serializer.type_id()
    }

    /// Appends one encoded frame to `dst`.
    ///
    /// Heartbeats are written as a bare header with `LENGTH = 0`.
    pub fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        if message.is_heartbeat() {
            dst.reserve(HEADER_LEN);
            put_header(dst, HEARTBEAT_KIND, 0);
            return Ok(());
        }

        let payload = self.serializer.serialize(message)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(AbrpcError::Codec(format!(
                "payload too large: {} bytes (max {} bytes)",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        dst.reserve(HEADER_LEN + payload.len());
        put_header(dst, self.serializer.type_id(), payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }

    /// Encodes one message into a standalone frame.
    pub fn encode_to_bytes(&self, message: &Message) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Takes the next complete message out of `src`.
    ///
    /// Returns `None` when no complete, well-formed frame is buffered. Bytes of
    /// an incomplete frame are left in place for the next read; bytes that
    /// can never form a valid frame are discarded.
    pub fn decode(&self, src: &mut BytesMut) -> Option<Message> {
        loop {
            if src.len() < HEADER_LEN {
                return None;
            }

            if src[..2] != MAGIC {
                if src[0] == 0 && src[1] == 0 {
                    debug!(len = src.len(), "Discarding non-protocol probe");
                } else {
                    warn!(
                        magic = format_args!("{:#04x} {:#04x}", src[0], src[1]),
                        len = src.len(),
                        "Bad frame magic, discarding buffered bytes"
                    );
                }
                src.clear();
                return None;
            }

            let version = src[2];
            let kind = src[3];
            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

            if len > MAX_PAYLOAD_LEN {
                warn!(len, max = MAX_PAYLOAD_LEN, "Frame length out of range, discarding buffered bytes");
                src.clear();
                return None;
            }

            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return None;
            }

            src.advance(HEADER_LEN);
            let payload = src.split_to(len);

            if version != VERSION {
                warn!(version, expected = VERSION, "Unsupported frame version, skipping frame");
                continue;
            }

            if kind == HEARTBEAT_KIND {
                trace!(role = ?self.role, "Heartbeat frame");
                return Some(self.heartbeat_message());
            }

            let Some(serializer) = self.registry.get(kind) else {
                warn!(kind, "No serializer registered for frame, skipping frame");
                continue;
            };

            match serializer.deserialize(&payload, self.role.inbound()) {
                Ok(message) => return Some(message),
                Err(e) => {
                    warn!(kind, len, error = %e, "Failed to deserialize frame payload, skipping frame");
                    continue;
                }
            }
        }
    }

    fn heartbeat_message(&self) -> Message {
        match self.role {
            Role::Client => Message::Response(Response::heartbeat("")),
            Role::Server => Message::Request(Request::heartbeat()),
        }
    }
}

fn put_header(dst: &mut BytesMut, kind: u8, len: u32) {
    dst.put_slice(&MAGIC);
    dst.put_u8(VERSION);
    dst.put_u8(kind);
    dst.put_u32(len);
}

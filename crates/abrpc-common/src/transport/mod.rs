//! abrpc Transport Layer
//!
//! This module provides the frame codec, the serializer registry and the
//! TCP plumbing both ends of a connection are built on.
//!
//! # Architecture
//!
//! - **Transport**: TCP, one long-lived connection per remote address
//! - **Framing**: 8-byte header (`0xAB 0xBA`, version, payload kind, length) + payload
//! - **Serialization**: pluggable, selected by the header's payload-kind byte (JSON built in)
//!
//! # Components
//!
//! - **[`FrameCodec`]**: Encode messages into frames and decode frames out of a read buffer
//! - **[`Serializer`]** / **[`SerializerRegistry`]**: Payload serializers keyed by wire id
//! - **[`TcpTransport`]**: Async TCP connect with timeouts
//! - **[`TcpServer`]**: Async multiplexing TCP server
//!
//! # Message Size Limits
//!
//! Frames with a payload larger than 10 MiB are rejected by the codec.

pub mod codec;
pub mod serializer;
pub mod tcp;
pub mod tcp_server;

pub use codec::{FrameCodec, Role, HEADER_LEN, HEARTBEAT_KIND, MAGIC, MAX_PAYLOAD_LEN, VERSION};
pub use serializer::{JsonSerializer, MessageType, Serializer, SerializerRegistry, JSON_SERIALIZER_ID};
pub use tcp::{TcpTransport, DEFAULT_CONNECT_TIMEOUT};
pub use tcp_server::TcpServer;

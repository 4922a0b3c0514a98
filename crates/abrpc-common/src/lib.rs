//! abrpc Common Types and Transport
//!
//! This crate provides the protocol definitions, wire codec and TCP transport
//! shared by abrpc consumers and providers.
//!
//! # Overview
//!
//! - **Protocol Layer**: Request/Response types, status classes and the error taxonomy
//! - **Transport Layer**: Frame codec, pluggable serializers, TCP connect and serve
//!
//! # Wire Format
//!
//! ```text
//! MAGIC(0xAB 0xBA) | VERSION(1) | PAYLOAD_KIND(1) | LENGTH(4, big-endian) | PAYLOAD
//! ```
//!
//! # Example
//!
//! ```
//! use abrpc_common::{Request, Response};
//! use serde_json::json;
//!
//! let request = Request::new("Echo", "ping", vec![]).with_timeout(5000);
//! let response = Response::success(request.id.clone(), json!("pong"));
//! assert!(response.is_success());
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;

//! abrpc Response Types
//!
//! This module defines the RPC response structure and the status-code
//! classification the client side uses to decide on retries and circuit
//! breaker accounting.

use serde::{Deserialize, Serialize};
use super::{MessageKind, RequestId, RpcValue};

/// Status codes understood by both ends of a connection.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const TOO_MANY_REQUESTS: u16 = 429;
    pub const INTERNAL_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const GATEWAY_TIMEOUT: u16 = 504;
}

/// Coarse class of a response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx
    Success,
    /// 4xx other than 429; never retried
    Client,
    /// 429 and 5xx; eligible for retry
    Transient,
    /// Anything else
    Other,
}

impl StatusClass {
    pub fn of(code: u16) -> Self {
        match code {
            200..=299 => StatusClass::Success,
            status::TOO_MANY_REQUESTS => StatusClass::Transient,
            400..=499 => StatusClass::Client,
            500..=599 => StatusClass::Transient,
            _ => StatusClass::Other,
        }
    }
}

/// An RPC response returned from a provider to the consumer.
///
/// # Response Flow
///
/// 1. Provider receives and dispatches a `Request`
/// 2. Provider creates a `Response` echoing the request id
/// 3. Response is framed and written back on the same connection
/// 4. Client correlates it to the pending invocation by id
///
/// # Example
///
/// ```
/// use abrpc_common::protocol::responses::Response;
/// use serde_json::json;
///
/// let ok = Response::success("r1", json!("pong"));
/// assert!(ok.is_success());
///
/// let missing = Response::error("r2", 404, "no such method");
/// assert!(!missing.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Request identifier this response corresponds to
    pub id: RequestId,
    /// Status code (200 on success)
    pub code: u16,
    /// Optional human readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result payload (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcValue>,
    #[serde(default)]
    pub kind: MessageKind,
}

impl Response {
    /// Creates a successful response.
    pub fn success(id: impl Into<RequestId>, result: RpcValue) -> Self {
        Response {
            id: id.into(),
            code: status::OK,
            message: None,
            result: Some(result),
            kind: MessageKind::Normal,
        }
    }

    /// Creates an error response with the given status code.
    pub fn error(id: impl Into<RequestId>, code: u16, message: impl Into<String>) -> Self {
        Response {
            id: id.into(),
            code,
            message: Some(message.into()),
            result: None,
            kind: MessageKind::Normal,
        }
    }

    /// Creates a heartbeat reply.
    pub fn heartbeat(id: impl Into<RequestId>) -> Self {
        Response {
            id: id.into(),
            code: status::OK,
            message: None,
            result: None,
            kind: MessageKind::Heartbeat,
        }
    }

    pub fn status_class(&self) -> StatusClass {
        StatusClass::of(self.code)
    }

    pub fn is_success(&self) -> bool {
        self.status_class() == StatusClass::Success
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == MessageKind::Heartbeat
    }
}

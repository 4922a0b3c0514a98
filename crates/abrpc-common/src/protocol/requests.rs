use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

pub type RequestId = String;
pub type InterfaceName = String;
pub type MethodName = String;
pub type RpcValue = serde_json::Value;

/// Identifier prefix reserved for heartbeat requests.
pub const HEARTBEAT_ID_PREFIX: &str = "heartbeat-";

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Whether a message carries a business payload or is a keep-alive probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    #[default]
    Normal,
    Heartbeat,
}

/// An RPC request sent from a consumer to a provider.
///
/// Requests are immutable once handed to a connection. The identifier must
/// be unique among the requests outstanding on the client, since it is the
/// key the response is correlated by.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub interface: InterfaceName,
    pub method: MethodName,
    #[serde(default)]
    pub param_types: Vec<String>,
    #[serde(default)]
    pub params: Vec<RpcValue>,
    #[serde(default)]
    pub kind: MessageKind,
    /// Per-request deadline override, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Request {
    pub fn new(
        interface: impl Into<String>,
        method: impl Into<String>,
        params: Vec<RpcValue>,
    ) -> Self {
        Request {
            id: generate_request_id(),
            interface: interface.into(),
            method: method.into(),
            param_types: Vec::new(),
            params,
            kind: MessageKind::Normal,
            timeout_ms: None,
        }
    }

    /// Creates a heartbeat request. Heartbeats carry no business payload.
    pub fn heartbeat() -> Self {
        Request {
            id: format!("{}{}", HEARTBEAT_ID_PREFIX, generate_request_id()),
            interface: String::new(),
            method: String::new(),
            param_types: Vec::new(),
            params: Vec::new(),
            kind: MessageKind::Heartbeat,
            timeout_ms: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_param_types<I, S>(mut self, param_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.param_types = param_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Returns a copy of this request under a newly generated identifier.
    ///
    /// Used when re-sending a logical call, so a late reply to an earlier
    /// attempt can never complete the new one.
    pub fn reissue(&self) -> Self {
        let mut request = self.clone();
        request.id = generate_request_id();
        request
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == MessageKind::Heartbeat
    }
}

/// Generates a process-unique request identifier.
///
/// The upper half comes from the wall clock so identifiers differ across
/// restarts; the lower half is a monotonically increasing counter.
pub fn generate_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

    format!("{:016x}", (timestamp & 0xFFFF_FFFF_0000_0000) | (counter & 0xFFFF_FFFF))
}

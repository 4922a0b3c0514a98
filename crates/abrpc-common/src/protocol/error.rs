use thiserror::Error;

use super::responses::{StatusClass, status};

#[derive(Error, Debug)]
pub enum AbrpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection unavailable: {0}")]
    Unavailable(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Unknown serializer: {0}")]
    UnknownSerializer(String),

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("Closed: {0}")]
    Closed(String),

    #[error("Request {0} cancelled")]
    Cancelled(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<AbrpcError>,
    },

    #[error("Duplicate request id: {0}")]
    DuplicateRequest(String),

    #[error("No provider available for {0}")]
    NoProvider(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AbrpcError {
    /// Whether a call that failed with this error may succeed if re-sent.
    ///
    /// Transport failures, timeouts and server-class remote codes
    /// (429, 5xx) are transient. Client-class codes, breaker rejections,
    /// cancellations and local encoding problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AbrpcError::Transport(_)
            | AbrpcError::Connection(_)
            | AbrpcError::Unavailable(_)
            | AbrpcError::Timeout { .. }
            | AbrpcError::Closed(_)
            | AbrpcError::NoProvider(_)
            | AbrpcError::Io(_) => true,
            AbrpcError::Remote { code, .. } => StatusClass::of(*code) == StatusClass::Transient,
            _ => false,
        }
    }

    /// Status code for a remote failure, if this is one.
    pub fn remote_code(&self) -> Option<u16> {
        match self {
            AbrpcError::Remote { code, .. } => Some(*code),
            AbrpcError::RetriesExhausted { source, .. } => source.remote_code(),
            _ => None,
        }
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.remote_code() == Some(status::TOO_MANY_REQUESTS)
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            AbrpcError::Timeout { .. } => true,
            AbrpcError::RetriesExhausted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, AbrpcError::CircuitOpen(_))
    }
}

impl From<std::net::AddrParseError> for AbrpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        AbrpcError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AbrpcError>;

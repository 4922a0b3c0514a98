use std::collections::HashMap;
use std::sync::Arc;

use crate::protocol::error::{AbrpcError, Result};
use crate::protocol::{Message, Request, Response};

/// Type id of the built-in JSON serializer.
pub const JSON_SERIALIZER_ID: u8 = 1;

/// Which message type a payload should be decoded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
}

/// Turns protocol messages into payload bytes and back.
///
/// Every serializer is identified on the wire by its [`type_id`](Self::type_id),
/// which the frame codec writes into the `PAYLOAD_KIND` header byte.
pub trait Serializer: Send + Sync {
    /// Wire identifier. Must not collide with the heartbeat marker.
    fn type_id(&self) -> u8;

    /// Name used to select this serializer from configuration.
    fn name(&self) -> &'static str;

    fn serialize(&self, message: &Message) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8], target: MessageType) -> Result<Message>;
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn type_id(&self) -> u8 {
        JSON_SERIALIZER_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        let bytes = match message {
            Message::Request(req) => serde_json::to_vec(req)?,
            Message::Response(resp) => serde_json::to_vec(resp)?,
        };
        Ok(bytes)
    }

    fn deserialize(&self, bytes: &[u8], target: MessageType) -> Result<Message> {
        let message = match target {
            MessageType::Request => Message::Request(serde_json::from_slice::<Request>(bytes)?),
            MessageType::Response => Message::Response(serde_json::from_slice::<Response>(bytes)?),
        };
        Ok(message)
    }
}

/// Explicit registry of serializers, keyed by wire id and by name.
///
/// Populated at startup; callers pick a serializer by the name found in
/// their configuration.
#[derive(Clone)]
pub struct SerializerRegistry {
    by_id: HashMap<u8, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self { by_id: HashMap::new() }
    }

    /// Creates a registry holding the built-in serializers.
    pub fn new() -> Self {
        let mut by_id: HashMap<u8, Arc<dyn Serializer>> = HashMap::new();
        by_id.insert(JSON_SERIALIZER_ID, Arc::new(JsonSerializer));
        Self { by_id }
    }

    /// Adds a serializer.
    ///
    /// # Errors
    ///
    /// Fails if the id is reserved for heartbeats or already taken.
    pub fn register(&mut self, serializer: Arc<dyn Serializer>) -> Result<()> {
        let id = serializer.type_id();
        if id == super::codec::HEARTBEAT_KIND {
            return Err(AbrpcError::InvalidRequest(format!(
                "serializer id {:#04x} is reserved for heartbeats",
                id
            )));
        }
        if self.by_id.contains_key(&id) {
            return Err(AbrpcError::InvalidRequest(format!(
                "serializer id {} already registered",
                id
            )));
        }
        self.by_id.insert(id, serializer);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Option<Arc<dyn Serializer>> {
        self.by_id.get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<dyn Serializer>> {
        self.by_id
            .values()
            .find(|s| s.name().eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| AbrpcError::UnknownSerializer(name.to_string()))
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

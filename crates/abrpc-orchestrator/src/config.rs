use std::path::Path;
use std::time::Duration;

use abrpc_client::{ConnectionManagerConfig, FutureManagerConfig};
use abrpc_common::protocol::error::Result;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryConfig;

/// Complete configuration of an [`Orchestrator`](crate::Orchestrator).
///
/// Every field has a default, so a JSON file only needs the values it
/// changes:
///
/// ```json
/// {
///   "request_timeout_ms": 2000,
///   "load_balance": "round_robin",
///   "retry": { "max_retries": 5 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for requests that don't set their own (milliseconds)
    pub request_timeout_ms: u64,
    /// Period of the pending-request timeout sweep (milliseconds)
    pub sweep_interval_ms: u64,
    /// Period of the connection health check (milliseconds)
    pub health_check_interval_ms: u64,
    /// TCP connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Delay between reconnect attempts; defaults to the retry base interval
    pub reconnect_backoff_ms: Option<u64>,
    pub max_reconnect_attempts: u32,
    /// Send heartbeats on healthy connections during health checks
    pub heartbeat: bool,
    /// Serializer name, looked up in the serializer registry
    pub serializer: String,
    /// Load-balance strategy name
    pub load_balance: String,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            sweep_interval_ms: 1_000,
            health_check_interval_ms: 10_000,
            connect_timeout_ms: 3_000,
            reconnect_backoff_ms: None,
            max_reconnect_attempts: 10,
            heartbeat: true,
            serializer: "json".to_string(),
            load_balance: "random".to_string(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn future_manager_config(&self) -> FutureManagerConfig {
        FutureManagerConfig {
            default_timeout: Duration::from_millis(self.request_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
        }
    }

    pub fn connection_manager_config(&self) -> ConnectionManagerConfig {
        let backoff = self.reconnect_backoff_ms.unwrap_or(self.retry.base_interval_ms);
        ConnectionManagerConfig {
            health_check_interval: Duration::from_millis(self.health_check_interval_ms.max(1)),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_backoff: Duration::from_millis(backoff),
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat: self.heartbeat,
        }
    }
}

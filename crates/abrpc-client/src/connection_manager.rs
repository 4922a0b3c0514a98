use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use abrpc_common::protocol::error::{AbrpcError, Result};
use abrpc_common::transport::{FrameCodec, Role, TcpTransport, DEFAULT_CONNECT_TIMEOUT};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::future_manager::FutureManager;

/// Connection manager configuration.
///
/// # Default Configuration
///
/// - `health_check_interval`: 10 seconds
/// - `connect_timeout`: 3 seconds
/// - `reconnect_backoff`: 50 milliseconds between reconnect attempts
/// - `max_reconnect_attempts`: 10
/// - `heartbeat`: enabled
///
/// # Example
///
/// ```rust
/// use abrpc_client::ConnectionManagerConfig;
/// use std::time::Duration;
///
/// let config = ConnectionManagerConfig {
///     health_check_interval: Duration::from_secs(30),
///     ..Default::default()
/// };
/// assert_eq!(config.max_reconnect_attempts, 10);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Period of the background health check
    pub health_check_interval: Duration,
    /// Timeout for establishing a TCP connection
    pub connect_timeout: Duration,
    /// Fixed delay between reconnect attempts
    pub reconnect_backoff: Duration,
    /// Reconnect attempts before an address is given up on
    pub max_reconnect_attempts: u32,
    /// Whether health checks send heartbeat frames on healthy connections
    pub heartbeat: bool,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_backoff: Duration::from_millis(50),
            max_reconnect_attempts: 10,
            heartbeat: true,
        }
    }
}

/// Cache of one multiplexed [`Connection`] per provider address.
///
/// # Architecture
///
/// - Connections are keyed by `host:port`
/// - A miss connects synchronously; concurrent misses for the same address
///   are serialized by a per-address lock so only one connection is opened
/// - The periodic health check evicts unavailable connections and spawns a
///   bounded background reconnect for each
///
/// # Example
///
/// ```rust,no_run
/// use abrpc_client::{ConnectionManager, ConnectionManagerConfig, FutureManager};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let futures = Arc::new(FutureManager::default());
/// let manager = Arc::new(ConnectionManager::new(ConnectionManagerConfig::default(), futures));
/// manager.start();
///
/// let conn = manager.get("127.0.0.1:9000").await?;
/// assert!(conn.is_available());
///
/// manager.shutdown_all();
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    connections: DashMap<String, Arc<Connection>>,
    connect_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    reconnecting: DashMap<String, CancellationToken>,
    transport: TcpTransport,
    codec: FrameCodec,
    futures: Arc<FutureManager>,
    config: ConnectionManagerConfig,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates a new connection manager using the JSON codec.
    ///
    /// # Arguments
    ///
    /// * `config` - The manager configuration
    /// * `futures` - Correlation registry shared by every connection
    pub fn new(config: ConnectionManagerConfig, futures: Arc<FutureManager>) -> Self {
        Self {
            connections: DashMap::new(),
            connect_locks: DashMap::new(),
            reconnecting: DashMap::new(),
            transport: TcpTransport::with_connect_timeout(config.connect_timeout),
            codec: FrameCodec::json(Role::Client),
            futures,
            config,
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
        }
    }

    /// Replaces the codec used for new connections.
    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.config
    }

    pub fn futures(&self) -> &Arc<FutureManager> {
        &self.futures
    }

    /// Returns the cached connection for `addr`, connecting on a miss.
    ///
    /// An unavailable cached connection counts as a miss and is replaced.
    ///
    /// # Errors
    ///
    /// - `Connection` if the provider can't be reached
    /// - `Closed` after [`shutdown_all`](Self::shutdown_all)
    pub async fn get(&self, addr: &str) -> Result<Arc<Connection>> {
        if let Some(conn) = self.available(addr) {
            return Ok(conn);
        }
        if self.shutdown.is_cancelled() {
            return Err(AbrpcError::Closed("connection manager shut down".to_string()));
        }

        let lock = self.connect_locks.entry(addr.to_string()).or_default().clone();
        let _guard = lock.lock().await;

        // Another task may have connected while we waited
        if let Some(conn) = self.available(addr) {
            return Ok(conn);
        }

        let conn = Arc::new(Connection::connect(addr, &self.transport, self.codec.clone(), self.futures.clone()).await?);
        if self.shutdown.is_cancelled() {
            conn.destroy();
            return Err(AbrpcError::Closed("connection manager shut down".to_string()));
        }

        if let Some(stale) = self.connections.insert(addr.to_string(), conn.clone()) {
            stale.destroy();
        }
        info!(addr, connection = conn.id(), "Connected to provider");
        Ok(conn)
    }

    /// Returns the cached connection for `addr` without connecting.
    pub fn get_cached(&self, addr: &str) -> Option<Arc<Connection>> {
        self.connections.get(addr).map(|entry| entry.value().clone())
    }

    fn available(&self, addr: &str) -> Option<Arc<Connection>> {
        self.get_cached(addr).filter(|conn| conn.is_available())
    }

    /// Evicts and destroys the connection for `addr`, cancelling any reconnect.
    pub fn remove(&self, addr: &str) -> bool {
        if let Some((_, token)) = self.reconnecting.remove(addr) {
            token.cancel();
        }
        self.connect_locks.remove(addr);
        match self.connections.remove(addr) {
            Some((_, conn)) => {
                conn.destroy();
                debug!(addr, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Addresses with a cached connection.
    pub fn addresses(&self) -> Vec<String> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a background reconnect is running for `addr`.
    pub fn is_reconnecting(&self, addr: &str) -> bool {
        self.reconnecting.contains_key(addr)
    }

    /// Runs one health check pass.
    ///
    /// Healthy connections get a heartbeat (if enabled). Unavailable ones
    /// are evicted and a background reconnect is scheduled for each.
    pub fn health_check(self: &Arc<Self>) {
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            let conn = entry.value();
            if !conn.is_available() {
                dead.push(entry.key().clone());
            } else if self.config.heartbeat {
                if let Err(e) = conn.send_heartbeat() {
                    debug!(addr = %entry.key(), error = %e, "Heartbeat failed");
                }
            }
        }

        for addr in dead {
            if let Some((_, conn)) = self.connections.remove_if(&addr, |_, conn| !conn.is_available()) {
                conn.destroy();
                warn!(addr = %addr, "Connection unavailable, scheduling reconnect");
                self.schedule_reconnect(addr);
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, addr: String) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let token = self.shutdown.child_token();
        match self.reconnecting.entry(addr.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            reconnect(&manager, &addr, &token).await;
            if let Some(manager) = manager.upgrade() {
                manager.reconnecting.remove(&addr);
            }
        });
    }

    /// Spawns the periodic health check. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.health_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let manager = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let period = self.config.health_check_interval;

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(manager) = manager.upgrade() else { break };
                manager.health_check();
            }
            debug!("Health check loop stopped");
        }));
    }

    /// Stops background work and destroys every connection.
    pub fn shutdown_all(&self) {
        self.shutdown.cancel();
        self.reconnecting.clear();
        self.connect_locks.clear();

        let addrs = self.addresses();
        for addr in &addrs {
            if let Some((_, conn)) = self.connections.remove(addr) {
                conn.destroy();
            }
        }
        info!(connections = addrs.len(), "Connection manager shut down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn reconnect(manager: &Weak<ConnectionManager>, addr: &str, token: &CancellationToken) {
    let Some((backoff, max_attempts)) = manager
        .upgrade()
        .map(|m| (m.config.reconnect_backoff, m.config.max_reconnect_attempts))
    else {
        return;
    };

    for attempt in 1..=max_attempts {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }

        let Some(manager) = manager.upgrade() else { return };
        if manager.available(addr).is_some() {
            return;
        }

        match manager.get(addr).await {
            Ok(conn) => {
                if token.is_cancelled() {
                    // Removed while we were connecting
                    manager.connections.remove_if(addr, |_, cached| Arc::ptr_eq(cached, &conn));
                    conn.destroy();
                } else {
                    info!(addr, attempt, "Reconnected to provider");
                }
                return;
            }
            Err(e) => debug!(addr, attempt, error = %e, "Reconnect attempt failed"),
        }
    }

    warn!(addr, attempts = max_attempts, "Giving up on reconnecting");
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use abrpc_common::protocol::error::{AbrpcError, Result};
use abrpc_common::protocol::{Request, Response};
use abrpc_common::transport::{FrameCodec, Role, TcpServer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::MethodRegistry;

/// abrpc provider node - serves a [`MethodRegistry`] over the frame protocol.
///
/// Every connection is multiplexed: requests are dispatched concurrently
/// and answered in completion order. Heartbeats are answered by the
/// transport without reaching the registry.
pub struct Node {
    registry: MethodRegistry,
    codec: FrameCodec,
    served: AtomicU64,
    failed: AtomicU64,
}

impl Node {
    /// Creates a node serving `registry` with the JSON serializer.
    pub fn new(registry: MethodRegistry) -> Self {
        Self {
            registry,
            codec: FrameCodec::json(Role::Server),
            served: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Replaces the codec, e.g. to answer with a different serializer.
    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Handles one request.
    ///
    /// # Arguments
    /// * `request` - The decoded request
    ///
    /// # Returns
    /// The response to send back; failures are expressed as error codes.
    pub async fn handle_request(&self, request: Request) -> Response {
        let start = Instant::now();
        let interface = request.interface.clone();
        let method = request.method.clone();

        let response = self.registry.dispatch(request).await;

        self.served.fetch_add(1, Ordering::Relaxed);
        if !response.is_success() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            request_id = %response.id,
            %interface,
            %method,
            code = response.code,
            elapsed_us = start.elapsed().as_micros() as u64,
            "Request handled"
        );
        response
    }

    /// Requests handled so far, including failed ones
    pub fn requests_served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Requests answered with a non-2xx code
    pub fn requests_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Binds `bind_addr` and starts serving in the background.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:9000"); port 0 picks a free port
    ///
    /// # Returns
    /// A handle for the running node. Dropping it stops the node.
    pub async fn bind(self, bind_addr: &str) -> Result<NodeHandle> {
        let node = Arc::new(self);
        let server = TcpServer::new(bind_addr).await?.with_codec(node.codec.clone());
        let local_addr = server.local_addr()?;
        let shutdown = server.shutdown_token();

        info!(
            addr = %local_addr,
            methods = node.registry.len(),
            interfaces = ?node.registry.interfaces(),
            "Node listening"
        );

        let serving = node.clone();
        let task = tokio::spawn(async move {
            server
                .run_with_handler(move |request: Request| {
                    let node = serving.clone();
                    async move { Ok(node.handle_request(request).await) }
                })
                .await
        });

        Ok(NodeHandle {
            node,
            local_addr,
            shutdown,
            task: Some(task),
        })
    }
}

/// A node serving in the background.
pub struct NodeHandle {
    node: Arc<Node>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(addr = %self.local_addr, "Node shutting down");
            self.shutdown.cancel();
        }
    }

    /// Waits until the node stops, either through [`shutdown`](Self::shutdown)
    /// or because accepting failed.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| AbrpcError::Transport(format!("Node task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

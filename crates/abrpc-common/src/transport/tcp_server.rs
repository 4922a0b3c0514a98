use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::error::{AbrpcError, Result};
use crate::protocol::{status, Message, Request, Response};
use crate::transport::codec::{FrameCodec, Role};

/// Initial capacity of each connection's read buffer
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Async TCP server speaking the abrpc frame protocol.
///
/// Each accepted connection gets a read loop and a writer task. Requests
/// are dispatched concurrently, so responses may be written in a different
/// order than the requests arrived; clients correlate by request id.
/// Heartbeat frames are answered directly without reaching the handler.
pub struct TcpServer {
    listener: TcpListener,
    codec: FrameCodec,
    shutdown: CancellationToken,
}

impl TcpServer {
    /// Creates a new TCP server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:9000")
    pub async fn new(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| AbrpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self {
            listener,
            codec: FrameCodec::json(Role::Server),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replaces the codec used for this server's connections.
    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| AbrpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Token that stops the accept loop and all connection tasks when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the server with the given request handler until shut down.
    ///
    /// A handler error is turned into a 500 response carrying the error text.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("TCP server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted
                    .map_err(|e| AbrpcError::Connection(format!("Failed to accept connection: {}", e)))?,
            };

            debug!(peer = %peer_addr, "Connection established");

            let handler = handler.clone();
            let codec = self.codec.clone();
            let shutdown = self.shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, codec, handler, shutdown).await {
                    warn!(peer = %peer_addr, error = %e, "Connection error");
                }
                debug!(peer = %peer_addr, "Connection closed");
            });
        }
    }
}

/// Handle a single TCP connection.
///
/// Processes frames until the peer closes the connection or the server
/// shuts down.
async fn handle_connection<F, Fut>(
    stream: TcpStream,
    codec: FrameCodec,
    handler: Arc<F>,
    shutdown: CancellationToken,
) -> Result<()>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    let write_codec = codec.clone();
    let writer_task = tokio::spawn(async move {
        let mut out = BytesMut::new();
        while let Some(response) = rx.recv().await {
            out.clear();
            if let Err(e) = write_codec.encode(&Message::Response(response), &mut out) {
                warn!(error = %e, "Failed to encode response");
                continue;
            }
            if let Err(e) = writer.write_all(&out).await {
                debug!(error = %e, "Failed to write response");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let result = loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(AbrpcError::Connection(format!("Failed to read: {}", e))),
        }

        while let Some(message) = codec.decode(&mut buf) {
            let request = match message {
                Message::Request(request) => request,
                Message::Response(response) => {
                    warn!(request_id = %response.id, "Unexpected response frame on server connection");
                    continue;
                }
            };

            if request.is_heartbeat() {
                trace!("Answering heartbeat");
                let _ = tx.send(Response::heartbeat(request.id));
                continue;
            }

            let handler = handler.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let request_id = request.id.clone();
                let response = match handler(request).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "Handler error");
                        Response::error(request_id, status::INTERNAL_ERROR, e.to_string())
                    }
                };
                let _ = tx.send(response);
            });
        }
    };

    drop(tx);
    if shutdown.is_cancelled() {
        writer_task.abort();
    }
    result
}

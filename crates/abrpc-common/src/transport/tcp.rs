use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};

use crate::protocol::error::{AbrpcError, Result};

/// Default timeout for establishing a TCP connection (3 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Async TCP transport for abrpc.
///
/// Establishes the raw byte streams that connections frame messages onto.
/// The transport itself is stateless; framing and correlation live in the
/// codec and in the client's connection type.
///
/// # Example
///
/// ```no_run
/// use abrpc_common::transport::TcpTransport;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::new();
/// let stream = transport.connect("127.0.0.1:9000").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Creates a new TCP transport with the default connect timeout.
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connects to a remote endpoint.
    ///
    /// Resolves the address (which may resolve to multiple addresses) and
    /// attempts each until one succeeds. Each attempt is bounded by the
    /// connect timeout. Nagle's algorithm is disabled on the returned stream.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The address cannot be resolved
    /// - Connection fails to all resolved addresses
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let socket_addrs = lookup_host(addr)
            .await
            .map_err(|e| AbrpcError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(addr = %socket_addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(Self::map_io_error(e, "connecting")),
                Err(_) => {
                    last_err = Some(AbrpcError::Connection(format!(
                        "connecting to {} timed out after {}ms",
                        socket_addr,
                        self.connect_timeout.as_millis()
                    )))
                }
            }
        }

        Err(AbrpcError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }

    /// Map IO errors to appropriate AbrpcError variants
    ///
    /// Converts standard IO errors into domain-specific errors:
    /// - Connection errors -> `Connection`
    /// - Other IO errors -> `Io`
    pub fn map_io_error(err: std::io::Error, context: &str) -> AbrpcError {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => {
                AbrpcError::Connection(format!("{}: {}", context, err))
            }
            _ => AbrpcError::Io(err),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use abrpc_common::protocol::error::{AbrpcError, Result};
use abrpc_common::protocol::{Message, Request, RequestId};
use abrpc_common::transport::{FrameCodec, TcpTransport};
use bytes::{Bytes, BytesMut};
use dashmap::DashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::future_manager::{completion_channel, Completion, FutureManager, ResponseFuture};

/// Initial capacity of the read buffer
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A frame queued for the writer task.
struct Outbound {
    /// `None` for heartbeats, which nobody waits on
    request_id: Option<RequestId>,
    frame: Bytes,
}

/// State shared between a connection handle and its I/O tasks.
struct Shared {
    id: u64,
    remote_addr: String,
    futures: Arc<FutureManager>,
    in_flight: DashSet<RequestId>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    /// Marks the connection closed and fails every request still in flight on it.
    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let stranded: Vec<RequestId> = self.in_flight.iter().map(|id| id.clone()).collect();
        if !stranded.is_empty() {
            warn!(
                connection = self.id,
                remote = %self.remote_addr,
                stranded = stranded.len(),
                reason,
                "Connection closed with requests in flight"
            );
        } else {
            debug!(connection = self.id, remote = %self.remote_addr, reason, "Connection closed");
        }

        for request_id in stranded {
            self.fail_request(&request_id, AbrpcError::Closed(format!("{}: {}", self.remote_addr, reason)));
        }
    }

    fn fail_request(&self, request_id: &str, cause: AbrpcError) {
        if self.in_flight.remove(request_id).is_some() {
            self.futures.fail(request_id, cause);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Per-connection request accounting.
#[derive(Default)]
struct Stats {
    active: AtomicUsize,
    total: AtomicU64,
    failed: AtomicU64,
    succeeded: AtomicU64,
    response_nanos: AtomicU64,
}

/// Accounts for one invocation from send until its terminal outcome.
///
/// The active counter is decremented exactly once: either when the outcome
/// is recorded or, if the completion is dropped unused, on drop.
struct CallGuard {
    stats: Arc<Stats>,
    shared: Arc<Shared>,
    request_id: RequestId,
    started: Instant,
    finished: bool,
}

impl CallGuard {
    fn new(stats: Arc<Stats>, shared: Arc<Shared>, request_id: RequestId) -> Self {
        stats.active.fetch_add(1, Ordering::SeqCst);
        stats.total.fetch_add(1, Ordering::Relaxed);
        Self {
            stats,
            shared,
            request_id,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, succeeded: bool) {
        if succeeded {
            let nanos = self.started.elapsed().as_nanos() as u64;
            self.stats.response_nanos.fetch_add(nanos, Ordering::Relaxed);
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.finished = true;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.in_flight.remove(&self.request_id);
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A multiplexed connection to one provider.
///
/// Any number of requests may be outstanding at once. [`invoke`](Self::invoke)
/// encodes the request, registers it with the shared [`FutureManager`] and
/// queues the frame for a dedicated writer task; a reader task routes each
/// response back by request id. Responses may arrive in any order.
///
/// When the peer closes the stream, a write fails, or the connection is
/// destroyed, every request still in flight on it fails with `Closed`.
pub struct Connection {
    shared: Arc<Shared>,
    stats: Arc<Stats>,
    codec: FrameCodec,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    /// Opens a TCP connection to `addr`.
    pub async fn connect(
        addr: &str,
        transport: &TcpTransport,
        codec: FrameCodec,
        futures: Arc<FutureManager>,
    ) -> Result<Self> {
        let stream = transport.connect(addr).await?;
        Ok(Self::from_stream(stream, addr, codec, futures))
    }

    /// Wraps an established byte stream and spawns its reader and writer tasks.
    ///
    /// `codec` must be a client-side codec. Must be called within a tokio runtime.
    pub fn from_stream<S>(
        stream: S,
        remote_addr: impl Into<String>,
        codec: FrameCodec,
        futures: Arc<FutureManager>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr: remote_addr.into(),
            futures,
            in_flight: DashSet::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(writer, rx, shared.clone()));
        tokio::spawn(read_loop(reader, codec.clone(), shared.clone()));

        debug!(connection = shared.id, remote = %shared.remote_addr, "Connection established");

        Self {
            shared,
            stats: Arc::new(Stats::default()),
            codec,
            outbound: tx,
        }
    }

    /// Sends a request and returns a future for its outcome.
    ///
    /// Never blocks waiting for the response. If the connection is
    /// unavailable, or the request can't be encoded or registered, the
    /// returned future is already failed.
    pub fn invoke(&self, request: Request) -> ResponseFuture {
        if !self.is_available() {
            return ResponseFuture::failed(AbrpcError::Unavailable(format!(
                "connection to {} is not available",
                self.shared.remote_addr
            )));
        }

        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.shared.futures.config().default_timeout);
        let request_id = request.id.clone();

        let frame = match self.codec.encode_to_bytes(&Message::Request(request)) {
            Ok(frame) => frame,
            Err(e) => return ResponseFuture::failed(e),
        };

        if !self.shared.in_flight.insert(request_id.clone()) {
            return ResponseFuture::failed(AbrpcError::DuplicateRequest(request_id));
        }

        let (complete, future) = completion_channel();
        let guard = CallGuard::new(self.stats.clone(), self.shared.clone(), request_id.clone());
        let completion: Completion = Box::new(move |result| {
            guard.finish(result.is_ok());
            complete(result);
        });

        // On rejection the completion is dropped and the guard releases the id
        if let Err(e) = self
            .shared
            .futures
            .register_with_timeout(request_id.clone(), timeout, completion)
        {
            return ResponseFuture::failed(e);
        }

        let queued = self.outbound.send(Outbound {
            request_id: Some(request_id.clone()),
            frame,
        });
        if queued.is_err() {
            self.shared.close("writer stopped");
            self.shared.fail_request(
                &request_id,
                AbrpcError::Unavailable(format!("connection to {} is not available", self.shared.remote_addr)),
            );
        } else if self.shared.is_closed() {
            // Closed between the availability check and the registration
            self.shared
                .fail_request(&request_id, AbrpcError::Closed(self.shared.remote_addr.clone()));
        }

        trace!(connection = self.shared.id, request_id = %request_id, "Request queued");
        future
    }

    /// Queues a heartbeat frame. The peer answers it without dispatching.
    pub fn send_heartbeat(&self) -> Result<()> {
        if !self.is_available() {
            return Err(AbrpcError::Unavailable(self.shared.remote_addr.clone()));
        }
        let frame = self.codec.encode_to_bytes(&Message::Request(Request::heartbeat()))?;
        self.outbound
            .send(Outbound { request_id: None, frame })
            .map_err(|_| AbrpcError::Unavailable(self.shared.remote_addr.clone()))
    }

    /// Whether the transport is open and accepting writes.
    pub fn is_available(&self) -> bool {
        !self.shared.is_closed() && !self.outbound.is_closed()
    }

    /// Closes the connection, failing in-flight requests with `Closed`. Idempotent.
    pub fn destroy(&self) {
        self.shared.close("connection destroyed");
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.shared.remote_addr
    }

    /// Requests sent and not yet completed.
    pub fn active_count(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.stats.total.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Mean latency of successfully completed requests.
    pub fn avg_response_time(&self) -> Duration {
        let succeeded = self.stats.succeeded.load(Ordering::Relaxed);
        if succeeded == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.stats.response_nanos.load(Ordering::Relaxed) / succeeded)
    }

    /// Fraction of completed requests that succeeded; 1.0 before any completed.
    pub fn success_rate(&self) -> f64 {
        let succeeded = self.stats.succeeded.load(Ordering::Relaxed);
        let failed = self.stats.failed.load(Ordering::Relaxed);
        let completed = succeeded + failed;
        if completed == 0 {
            return 1.0;
        }
        succeeded as f64 / completed as f64
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close("connection dropped");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("remote_addr", &self.shared.remote_addr)
            .field("available", &self.is_available())
            .field("active", &self.active_count())
            .finish()
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let outbound = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        if let Err(e) = writer.write_all(&outbound.frame).await {
            warn!(connection = shared.id, remote = %shared.remote_addr, error = %e, "Write failed");
            if let Some(request_id) = outbound.request_id {
                shared.fail_request(
                    &request_id,
                    AbrpcError::Unavailable(format!("write to {} failed: {}", shared.remote_addr, e)),
                );
            }
            shared.close("write failed");
            break;
        }
    }

    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        if let Some(request_id) = outbound.request_id {
            shared.fail_request(&request_id, AbrpcError::Closed(shared.remote_addr.clone()));
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(mut reader: R, codec: FrameCodec, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

    let reason = loop {
        let read = tokio::select! {
            _ = shared.shutdown.cancelled() => break "connection destroyed",
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => break "closed by peer",
            Ok(_) => {}
            Err(e) => {
                debug!(connection = shared.id, error = %e, "Read failed");
                break "read failed";
            }
        }

        while let Some(message) = codec.decode(&mut buf) {
            match message {
                Message::Response(response) if response.is_heartbeat() => {
                    trace!(connection = shared.id, "Heartbeat acknowledged");
                }
                Message::Response(response) => {
                    let request_id = response.id.clone();
                    shared.futures.resolve(&request_id, response);
                }
                Message::Request(request) => {
                    warn!(connection = shared.id, request_id = %request.id, "Unexpected request frame on client connection");
                }
            }
        }
    };

    shared.close(reason);
}

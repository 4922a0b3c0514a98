//! Correlation of asynchronous responses with the calls that issued them.
//!
//! Every outstanding request is registered under its id together with a
//! completion callback. Exactly one of the following completes it, whichever
//! removes the entry first:
//!
//! - [`FutureManager::resolve`] when the matching response arrives
//! - [`FutureManager::fail`] / [`FutureManager::cancel`] on a local failure
//! - the background sweep, once the entry outlives its timeout
//! - [`FutureManager::shutdown`], which fails everything still pending
//!
//! Removal from the underlying [`DashMap`] is atomic, so the completion runs
//! exactly once no matter how these race.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use abrpc_common::protocol::error::{AbrpcError, Result};
use abrpc_common::protocol::{RequestId, Response};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Callback receiving the single terminal outcome of a pending invocation.
pub type Completion = Box<dyn FnOnce(Result<Response>) + Send + Sync + 'static>;

/// Correlation registry configuration.
#[derive(Debug, Clone)]
pub struct FutureManagerConfig {
    /// Timeout applied to requests that don't carry their own
    pub default_timeout: Duration,
    /// How often pending entries are checked for expiry
    pub sweep_interval: Duration,
}

impl Default for FutureManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

struct PendingInvocation {
    completion: Completion,
    created_at: Instant,
    timeout: Duration,
}

impl PendingInvocation {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.timeout
    }
}

/// Registry of in-flight requests awaiting a response.
///
/// Shared by every connection of a client. Construct it once, call
/// [`start`](Self::start) from within a tokio runtime to run the timeout
/// sweep, and [`shutdown`](Self::shutdown) when the client goes away.
pub struct FutureManager {
    pending: DashMap<RequestId, PendingInvocation>,
    config: FutureManagerConfig,
    closed: AtomicBool,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl FutureManager {
    pub fn new(config: FutureManagerConfig) -> Self {
        Self {
            pending: DashMap::new(),
            config,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FutureManagerConfig {
        &self.config
    }

    /// Spawns the periodic timeout sweep. Calling it again is a no-op.
    ///
    /// The task only holds a weak reference, so dropping the last `Arc`
    /// also ends the sweep.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() || self.is_closed() {
            return;
        }

        let manager = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let period = self.config.sweep_interval;

        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(manager) = manager.upgrade() else { break };
                let expired = manager.sweep();
                if expired > 0 {
                    debug!(expired, "Timed out pending invocations");
                }
            }
        }));
    }

    /// Registers a request under the default timeout.
    pub fn register(&self, request_id: impl Into<RequestId>, completion: Completion) -> Result<()> {
        self.register_with_timeout(request_id, self.config.default_timeout, completion)
    }

    /// Registers a request that times out after `timeout`.
    ///
    /// On error the completion is dropped without being invoked.
    ///
    /// # Errors
    ///
    /// - `DuplicateRequest` if the id is already pending
    /// - `Closed` if the manager has been shut down
    pub fn register_with_timeout(
        &self,
        request_id: impl Into<RequestId>,
        timeout: Duration,
        completion: Completion,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(AbrpcError::Closed("future manager shut down".to_string()));
        }

        let request_id = request_id.into();
        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => return Err(AbrpcError::DuplicateRequest(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingInvocation {
                    completion,
                    created_at: Instant::now(),
                    timeout,
                });
            }
        }

        // A concurrent shutdown may have drained the map before the insert
        if self.is_closed() {
            self.fail(&request_id, AbrpcError::Closed("future manager shut down".to_string()));
        }
        Ok(())
    }

    /// Completes a pending invocation with its response.
    ///
    /// Returns `false` if nothing was pending under that id, e.g. because
    /// the request already timed out.
    pub fn resolve(&self, request_id: &str, response: Response) -> bool {
        match self.pending.remove(request_id) {
            Some((_, pending)) => {
                (pending.completion)(Ok(response));
                true
            }
            None => {
                warn!(request_id, "Response for unknown or expired request");
                false
            }
        }
    }

    /// Completes a pending invocation with an error.
    pub fn fail(&self, request_id: &str, cause: AbrpcError) -> bool {
        match self.pending.remove(request_id) {
            Some((_, pending)) => {
                (pending.completion)(Err(cause));
                true
            }
            None => {
                debug!(request_id, error = %cause, "Failure for request that is no longer pending");
                false
            }
        }
    }

    /// Caller-initiated cancellation. Loses cleanly to a response that already won.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.fail(request_id, AbrpcError::Cancelled(request_id.to_string()))
    }

    /// Fails every entry older than its timeout. Returns how many expired.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut count = 0;
        for request_id in expired {
            if let Some((_, pending)) = self.pending.remove_if(&request_id, |_, p| p.is_expired(now)) {
                let timeout_ms = pending.timeout.as_millis() as u64;
                (pending.completion)(Err(AbrpcError::Timeout { request_id, timeout_ms }));
                count += 1;
            }
        }
        count
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the sweep and fails all pending entries with `Closed`.
    ///
    /// Idempotent; later registrations are rejected.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let ids: Vec<RequestId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let drained = ids.len();
        for request_id in ids {
            self.fail(&request_id, AbrpcError::Closed("client shut down".to_string()));
        }
        debug!(drained, "Future manager shut down");
    }
}

impl Default for FutureManager {
    fn default() -> Self {
        Self::new(FutureManagerConfig::default())
    }
}

impl Drop for FutureManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Future resolving to the outcome of one invocation.
///
/// Yields `Closed` if the completion was dropped without being invoked.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response>>,
}

impl ResponseFuture {
    /// A future that is already failed with `err`.
    pub fn failed(err: AbrpcError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(AbrpcError::Closed("completion dropped".to_string())))
        })
    }
}

/// Creates a completion callback and the future it resolves.
pub fn completion_channel() -> (Completion, ResponseFuture) {
    let (tx, rx) = oneshot::channel();
    let completion: Completion = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (completion, ResponseFuture { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_completion(counter: &Arc<AtomicUsize>) -> Completion {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_registry_is_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Completion>();
        assert_send_sync::<FutureManager>();
        assert_send_sync::<std::sync::Weak<FutureManager>>();
    }

    #[test]
    fn test_config_default() {
        let config = FutureManagerConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(5));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_resolve_completes_and_removes() {
        let manager = FutureManager::default();
        let (completion, future) = completion_channel();
        manager.register("r1", completion).unwrap();
        assert!(manager.is_pending("r1"));

        assert!(manager.resolve("r1", Response::success("r1", json!("pong"))));
        let response = future.await.unwrap();
        assert_eq!(response.result, Some(json!("pong")));
        assert!(!manager.is_pending("r1"));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_completes_with_error() {
        let manager = FutureManager::default();
        let (completion, future) = completion_channel();
        manager.register("r1", completion).unwrap();

        assert!(manager.fail("r1", AbrpcError::Unavailable("write failed".into())));
        assert!(matches!(future.await, Err(AbrpcError::Unavailable(_))));
    }

    #[test]
    fn test_duplicate_register_is_rejected() {
        let manager = FutureManager::default();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register("r1", counting_completion(&counter)).unwrap();

        let err = manager.register("r1", counting_completion(&counter)).unwrap_err();
        assert!(matches!(err, AbrpcError::DuplicateRequest(id) if id == "r1"));
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_late_resolve_is_noop() {
        let manager = FutureManager::default();
        assert!(!manager.resolve("missing", Response::success("missing", json!(null))));
        assert!(!manager.fail("missing", AbrpcError::Cancelled("missing".into())));
    }

    #[tokio::test]
    async fn test_cancel_then_response_is_noop() {
        let manager = FutureManager::default();
        let (completion, future) = completion_channel();
        manager.register("r1", completion).unwrap();

        assert!(manager.cancel("r1"));
        assert!(!manager.resolve("r1", Response::success("r1", json!(1))));
        assert!(matches!(future.await, Err(AbrpcError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_after_default_timeout() {
        let manager = Arc::new(FutureManager::default());
        manager.start();

        let (completion, future) = completion_channel();
        manager.register("r1", completion).unwrap();

        let started = Instant::now();
        let result = future.await;
        let elapsed = started.elapsed();

        match result {
            Err(AbrpcError::Timeout { request_id, timeout_ms }) => {
                assert_eq!(request_id, "r1");
                assert_eq!(timeout_ms, 5000);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(elapsed >= Duration::from_secs(5), "timed out early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(6), "timed out late: {:?}", elapsed);
        assert!(!manager.is_pending("r1"));
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_request_timeout() {
        let manager = Arc::new(FutureManager::default());
        manager.start();

        let (completion, future) = completion_channel();
        manager
            .register_with_timeout("short", Duration::from_millis(1500), completion)
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register("long", counting_completion(&counter)).unwrap();

        assert!(matches!(future.await, Err(AbrpcError::Timeout { timeout_ms: 1500, .. })));
        assert!(manager.is_pending("long"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        manager.shutdown();
    }

    #[test]
    fn test_sweep_leaves_fresh_entries() {
        let manager = FutureManager::default();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register("fresh", counting_completion(&counter)).unwrap();
        manager
            .register_with_timeout("stale", Duration::ZERO, counting_completion(&counter))
            .unwrap();

        assert_eq!(manager.sweep(), 1);
        assert!(manager.is_pending("fresh"));
        assert!(!manager.is_pending("stale"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_all_pending() {
        let manager = Arc::new(FutureManager::default());
        manager.start();

        let futures: Vec<_> = (0..10)
            .map(|i| {
                let (completion, future) = completion_channel();
                manager.register(format!("r{}", i), completion).unwrap();
                future
            })
            .collect();

        manager.shutdown();
        manager.shutdown();

        for future in futures {
            assert!(matches!(future.await, Err(AbrpcError::Closed(_))));
        }
        assert_eq!(manager.pending_count(), 0);

        let (completion, _future) = completion_channel();
        assert!(matches!(manager.register("late", completion), Err(AbrpcError::Closed(_))));
    }

    #[test]
    fn test_exactly_once_under_racing_resolve_fail_and_sweep() {
        use std::thread;

        for round in 0..200 {
            let manager = Arc::new(FutureManager::default());
            let counter = Arc::new(AtomicUsize::new(0));
            let id = format!("race-{}", round);
            manager
                .register_with_timeout(id.clone(), Duration::ZERO, counting_completion(&counter))
                .unwrap();

            let barrier = Arc::new(std::sync::Barrier::new(3));
            let handles: Vec<_> = (0..3)
                .map(|which| {
                    let manager = manager.clone();
                    let barrier = barrier.clone();
                    let id = id.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        match which {
                            0 => {
                                manager.resolve(&id, Response::success(id.clone(), json!(1)));
                            }
                            1 => {
                                manager.fail(&id, AbrpcError::Cancelled(id.clone()));
                            }
                            _ => {
                                manager.sweep();
                            }
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(counter.load(Ordering::SeqCst), 1, "round {}", round);
            assert_eq!(manager.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_dropped_completion_yields_closed() {
        let (completion, future) = completion_channel();
        drop(completion);
        assert!(matches!(future.await, Err(AbrpcError::Closed(_))));
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let manager = Arc::new(FutureManager::default());
        manager.start();
        manager.start();
        assert!(manager.sweeper.lock().unwrap().is_some());
        manager.shutdown();
    }
}

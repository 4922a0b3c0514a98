//! Orchestrator integration tests
//!
//! Each test runs one or more real providers on loopback and drives them
//! through the full consumer path: breaker, discovery, load balancing,
//! connection manager, correlation registry and retry policy.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use abrpc_common::protocol::error::{AbrpcError, Result};
use abrpc_common::protocol::{status, Request, Response};
use abrpc_common::transport::TcpServer;
use abrpc_orchestrator::{
    AddressListener, CircuitBreakerConfig, CircuitState, ClientConfig, Orchestrator, RetryConfig, RoundRobinBalance,
    ServiceDiscovery, StaticDiscovery,
};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Test provider running on a random loopback port
struct TestProvider {
    addr: String,
    calls: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl TestProvider {
    async fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let shutdown = server.shutdown_token();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        tokio::spawn(async move {
            server
                .run_with_handler(move |req: Request| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    handler(req)
                })
                .await
        });

        Self { addr, calls, shutdown }
    }

    /// Replies to every call with `code`.
    async fn with_status(code: u16) -> Self {
        Self::start(move |req: Request| async move {
            if code == status::OK {
                Ok(Response::success(req.id, json!(null)))
            } else {
                Ok(Response::error(req.id, code, format!("status {}", code)))
            }
        })
        .await
    }

    /// `Echo` provider: `ping` -> "pong", `echo(x)` -> x, `sleep(ms)` waits first.
    async fn echo() -> Self {
        Self::start(|req: Request| async move {
            match req.method.as_str() {
                "ping" => Ok(Response::success(req.id, json!("pong"))),
                "echo" => Ok(Response::success(req.id, req.params.first().cloned().unwrap_or_default())),
                "sleep" => {
                    let ms = req.params.first().and_then(|v| v.as_u64()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(Response::success(req.id, json!(ms)))
                }
                other => Ok(Response::error(req.id, status::NOT_FOUND, format!("no method {}", other))),
            }
        })
        .await
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Drop for TestProvider {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_interval_ms: 20,
        min_interval_ms: 1,
        max_interval_ms: 1_000,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn orchestrator_for(addrs: Vec<String>, config: ClientConfig) -> (Orchestrator, Arc<StaticDiscovery>) {
    let discovery = Arc::new(StaticDiscovery::new());
    for service in ["Echo", "Flaky"] {
        discovery.set_addresses(service, addrs.clone());
    }
    let orchestrator = Orchestrator::new(config, discovery.clone()).unwrap();
    (orchestrator, discovery)
}

/// Discovery that takes `delay` to answer.
struct SlowDiscovery {
    inner: StaticDiscovery,
    delay: Duration,
}

#[async_trait]
impl ServiceDiscovery for SlowDiscovery {
    async fn discover(&self, service: &str) -> Result<Vec<String>> {
        tokio::time::sleep(self.delay).await;
        self.inner.discover(service).await
    }

    fn subscribe(&self, service: &str, listener: AddressListener) {
        self.inner.subscribe(service, listener);
    }

    async fn is_healthy(&self, service: &str) -> bool {
        self.inner.is_healthy(service).await
    }
}

// ============================================================================
// End-to-end calls
// ============================================================================

#[tokio::test]
async fn test_ping_returns_pong_and_leaves_no_pending_entry() {
    let provider = TestProvider::echo().await;
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], ClientConfig::default());

    let response = orchestrator
        .invoke_request(Request::new("Echo", "ping", vec![]).with_id("r1"))
        .await
        .unwrap();

    assert_eq!(response.id, "r1");
    assert_eq!(response.code, status::OK);
    assert_eq!(response.result, Some(json!("pong")));
    assert_eq!(orchestrator.futures().pending_count(), 0);
    assert!(!orchestrator.futures().is_pending("r1"));
    assert_eq!(orchestrator.breaker("Echo").unwrap().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_proxy_typed_call() {
    let provider = TestProvider::echo().await;
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], ClientConfig::default());

    let echo = orchestrator.proxy("Echo");
    let reply: String = echo.call_as("echo", vec![json!("hello")]).await.unwrap();
    assert_eq!(reply, "hello");

    let numbers: Vec<i64> = echo.call_as("echo", vec![json!([1, 2, 3])]).await.unwrap();
    assert_eq!(numbers, vec![1, 2, 3]);

    let mismatch = echo.call_as::<u32>("echo", vec![json!("nope")]).await;
    assert!(matches!(mismatch, Err(AbrpcError::JsonSerialization(_))));
}

#[tokio::test]
async fn test_many_concurrent_calls_share_one_connection() {
    let provider = TestProvider::echo().await;
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], ClientConfig::default());

    let calls = (0..100).map(|i| orchestrator.invoke("Echo", "echo", vec![json!(i)]));
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i));
    }
    assert_eq!(orchestrator.connections().connection_count(), 1);
    assert_eq!(orchestrator.futures().pending_count(), 0);
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let provider = TestProvider::echo().await;
    let config = ClientConfig {
        request_timeout_ms: 300,
        sweep_interval_ms: 50,
        retry: RetryConfig::disabled(),
        ..Default::default()
    };
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], config);

    let started = Instant::now();
    let result = orchestrator
        .invoke_request(Request::new("Echo", "sleep", vec![json!(5_000)]).with_id("slow"))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(AbrpcError::Timeout { timeout_ms: 300, .. })), "{:?}", result);
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1_000), "{:?}", elapsed);
    assert!(!orchestrator.futures().is_pending("slow"));
}

#[tokio::test]
async fn test_per_request_timeout_overrides_default() {
    let provider = TestProvider::echo().await;
    let config = ClientConfig {
        sweep_interval_ms: 20,
        retry: RetryConfig::disabled(),
        ..Default::default()
    };
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], config);

    let result = orchestrator
        .proxy("Echo")
        .with_timeout(100)
        .call("sleep", vec![json!(2_000)])
        .await;
    assert!(matches!(result, Err(AbrpcError::Timeout { timeout_ms: 100, .. })));
}

// ============================================================================
// Retry eligibility
// ============================================================================

#[tokio::test]
async fn test_not_found_is_never_retried() {
    let provider = TestProvider::with_status(status::NOT_FOUND).await;
    let config = ClientConfig {
        retry: fast_retry(3),
        ..Default::default()
    };
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], config);

    let err = orchestrator.invoke("Echo", "missing", vec![]).await.unwrap_err();
    assert!(matches!(err, AbrpcError::Remote { code: 404, .. }), "{:?}", err);
    assert_eq!(provider.calls(), 1);
    assert_eq!(orchestrator.breaker("Echo").unwrap().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_service_unavailable_retries_then_surfaces_last_failure() {
    let provider = TestProvider::with_status(status::SERVICE_UNAVAILABLE).await;
    let config = ClientConfig {
        retry: fast_retry(3),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 100,
            ..Default::default()
        },
        ..Default::default()
    };
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], config);

    match orchestrator.invoke("Echo", "ping", vec![]).await {
        Err(AbrpcError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 4);
            assert!(matches!(*source, AbrpcError::Remote { code: 503, .. }));
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(provider.calls(), 4);
}

#[tokio::test]
async fn test_too_many_requests_backs_off_twice_as_long() {
    let config = ClientConfig {
        retry: RetryConfig {
            max_retries: 1,
            base_interval_ms: 100,
            jitter: false,
            ..Default::default()
        },
        ..Default::default()
    };

    let unavailable = TestProvider::with_status(status::SERVICE_UNAVAILABLE).await;
    let (orchestrator, _d1) = orchestrator_for(vec![unavailable.addr.clone()], config.clone());
    orchestrator.invoke("Echo", "warmup", vec![]).await.unwrap_err();
    let started = Instant::now();
    orchestrator.invoke("Echo", "ping", vec![]).await.unwrap_err();
    let plain = started.elapsed();

    let throttled = TestProvider::with_status(status::TOO_MANY_REQUESTS).await;
    let (orchestrator, _d2) = orchestrator_for(vec![throttled.addr.clone()], config);
    orchestrator.invoke("Echo", "warmup", vec![]).await.unwrap_err();
    let started = Instant::now();
    let err = orchestrator.invoke("Echo", "ping", vec![]).await.unwrap_err();
    let slow = started.elapsed();

    assert!(err.is_too_many_requests());
    assert!(plain >= Duration::from_millis(100), "{:?}", plain);
    assert!(slow >= Duration::from_millis(200), "{:?}", slow);
}

#[tokio::test]
async fn test_failover_to_live_provider() {
    let provider = TestProvider::echo().await;
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let config = ClientConfig {
        retry: fast_retry(2),
        ..Default::default()
    };
    let discovery = Arc::new(StaticDiscovery::new());
    discovery.set_addresses("Echo", vec![dead, provider.addr.clone()]);
    let orchestrator = Orchestrator::new(config, discovery)
        .unwrap()
        .with_load_balance(Arc::new(RoundRobinBalance::new()));

    let pong = orchestrator.invoke("Echo", "ping", vec![]).await.unwrap();
    assert_eq!(pong, json!("pong"));
    assert_eq!(provider.calls(), 1);
}

// ============================================================================
// Circuit breaking
// ============================================================================

#[tokio::test]
async fn test_open_circuit_fails_fast_without_network() {
    let provider = TestProvider::with_status(status::INTERNAL_ERROR).await;
    let config = ClientConfig {
        retry: RetryConfig::disabled(),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], config);

    for _ in 0..2 {
        let err = orchestrator.invoke("Flaky", "work", vec![]).await.unwrap_err();
        assert_eq!(err.remote_code(), Some(500));
    }
    assert_eq!(orchestrator.breaker("Flaky").unwrap().state(), CircuitState::Open);

    let err = orchestrator.invoke("Flaky", "work", vec![]).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert!(!err.is_transient());
    assert_eq!(provider.calls(), 2);

    // Breakers are per interface
    assert_eq!(orchestrator.invoke("Echo", "work", vec![]).await.unwrap_err().remote_code(), Some(500));
}

#[tokio::test]
async fn test_circuit_opening_mid_retry_stops_the_sequence() {
    let provider = TestProvider::with_status(status::SERVICE_UNAVAILABLE).await;
    let config = ClientConfig {
        retry: fast_retry(5),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], config);

    let err = orchestrator.invoke("Echo", "ping", vec![]).await.unwrap_err();
    assert!(err.is_circuit_open(), "{:?}", err);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn test_circuit_recovers_after_reset_timeout() {
    let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = healthy.clone();
    let provider = TestProvider::start(move |req: Request| {
        let ok = flag.load(Ordering::SeqCst);
        async move {
            if ok {
                Ok(Response::success(req.id, json!("ok")))
            } else {
                Ok(Response::error(req.id, status::SERVICE_UNAVAILABLE, "down"))
            }
        }
    })
    .await;

    let config = ClientConfig {
        retry: RetryConfig::disabled(),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 100,
            max_half_open_requests: 1,
            success_rate_threshold: 1.0,
        },
        ..Default::default()
    };
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], config);

    orchestrator.invoke("Echo", "ping", vec![]).await.unwrap_err();
    assert!(orchestrator.invoke("Echo", "ping", vec![]).await.unwrap_err().is_circuit_open());

    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(orchestrator.invoke("Echo", "ping", vec![]).await.unwrap(), json!("ok"));
    assert_eq!(orchestrator.breaker("Echo").unwrap().state(), CircuitState::Closed);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_cancel_in_flight_call() {
    let provider = TestProvider::echo().await;
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], ClientConfig::default());

    let call = orchestrator.invoke_request(Request::new("Echo", "sleep", vec![json!(5_000)]).with_id("c1"));
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.cancel("c1")
    };
    let (result, cancelled) = tokio::join!(call, cancel);

    assert!(cancelled);
    assert!(matches!(result, Err(AbrpcError::Cancelled(_))), "{:?}", result);
    assert!(!orchestrator.cancel("c1"));
    assert_eq!(orchestrator.futures().pending_count(), 0);
}

#[tokio::test]
async fn test_cancel_during_discovery() {
    let provider = TestProvider::echo().await;
    let discovery = Arc::new(SlowDiscovery {
        inner: StaticDiscovery::with_services(["Echo"], vec![provider.addr.clone()]),
        delay: Duration::from_millis(100),
    });
    let orchestrator = Orchestrator::new(ClientConfig::default(), discovery).unwrap();

    let call = orchestrator.invoke_request(Request::new("Echo", "ping", vec![]).with_id("c1"));
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        orchestrator.cancel("c1")
    };
    let (result, cancelled) = tokio::join!(call, cancel);

    assert!(cancelled);
    assert!(matches!(result, Err(AbrpcError::Cancelled(_))), "{:?}", result);
    assert_eq!(provider.calls(), 0);
    assert_eq!(orchestrator.futures().pending_count(), 0);
}

#[tokio::test]
async fn test_cancel_during_retry_backoff() {
    let provider = TestProvider::with_status(status::SERVICE_UNAVAILABLE).await;
    let config = ClientConfig {
        retry: RetryConfig {
            base_interval_ms: 2_000,
            max_interval_ms: 10_000,
            ..fast_retry(3)
        },
        ..Default::default()
    };
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], config);

    let started = Instant::now();
    let call = orchestrator.invoke_request(Request::new("Flaky", "op", vec![]).with_id("c2"));
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        orchestrator.cancel("c2")
    };
    let (result, cancelled) = tokio::join!(call, cancel);

    assert!(cancelled);
    assert!(matches!(result, Err(AbrpcError::Cancelled(_))), "{:?}", result);
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_duplicate_call_id_is_rejected() {
    let provider = TestProvider::echo().await;
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], ClientConfig::default());

    let first = orchestrator.invoke_request(Request::new("Echo", "sleep", vec![json!(100)]).with_id("dup"));
    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        orchestrator
            .invoke_request(Request::new("Echo", "ping", vec![]).with_id("dup"))
            .await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.is_ok());
    assert!(matches!(second, Err(AbrpcError::DuplicateRequest(_))));
}

#[tokio::test]
async fn test_vanished_provider_connection_is_closed() {
    let provider = TestProvider::echo().await;
    let (orchestrator, discovery) = orchestrator_for(vec![provider.addr.clone()], ClientConfig::default());

    orchestrator.invoke("Echo", "ping", vec![]).await.unwrap();
    let conn = orchestrator.connections().get_cached(&provider.addr).unwrap();
    assert_eq!(discovery.subscriber_count("Echo"), 1);

    discovery.set_addresses("Echo", vec![]);
    assert_eq!(orchestrator.connections().connection_count(), 0);
    assert!(!conn.is_available());
}

#[tokio::test]
async fn test_shutdown_fails_pending_and_rejects_new_calls() {
    let provider = TestProvider::echo().await;
    let config = ClientConfig {
        retry: RetryConfig::disabled(),
        ..Default::default()
    };
    let (orchestrator, _discovery) = orchestrator_for(vec![provider.addr.clone()], config);

    let call = orchestrator.invoke("Echo", "sleep", vec![json!(5_000)]);
    let shutdown = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.shutdown();
    };
    let (result, ()) = tokio::join!(call, shutdown);

    assert!(matches!(result, Err(AbrpcError::Closed(_))), "{:?}", result);
    assert!(matches!(
        orchestrator.invoke("Echo", "ping", vec![]).await,
        Err(AbrpcError::Closed(_))
    ));
}

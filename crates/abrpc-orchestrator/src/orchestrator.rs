use std::sync::{Arc, Mutex, PoisonError};

use abrpc_client::{ConnectionManager, FutureManager};
use abrpc_common::protocol::error::{AbrpcError, Result};
use abrpc_common::protocol::{Request, RequestId, Response, RpcValue, StatusClass};
use abrpc_common::transport::{FrameCodec, Role, SerializerRegistry};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::config::ClientConfig;
use crate::discovery::ServiceDiscovery;
use crate::load_balancer::{load_balancer_by_name, LoadBalance};
use crate::proxy::ServiceProxy;
use crate::retry::RetryContext;

/// abrpc Orchestrator - the consumer-side entry point for remote calls.
///
/// For every call the orchestrator:
///
/// 1. **Circuit Breaking**: Asks the target interface's breaker for permission;
///    an open circuit fails fast with `CircuitOpen`
/// 2. **Discovery**: Resolves provider addresses for the interface
/// 3. **Load Balancing**: Picks one address
/// 4. **Invocation**: Sends the request over the cached connection to that address
/// 5. **Retry Logic**: Retries transient failures with exponential backoff,
///    passing through the breaker again on every attempt
///
/// The correlation registry, connection manager and breakers are owned here
/// and torn down by [`shutdown`](Self::shutdown).
pub struct Orchestrator {
    config: ClientConfig,
    futures: Arc<FutureManager>,
    connections: Arc<ConnectionManager>,
    breakers: CircuitBreakerRegistry,
    discovery: Arc<dyn ServiceDiscovery>,
    balancer: Arc<dyn LoadBalance>,
    subscribed: DashSet<String>,
    calls: DashMap<RequestId, CallState>,
}

/// A logical call in progress.
struct CallState {
    /// Id of the current attempt
    attempt_id: RequestId,
    cancelled: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator with the built-in serializers.
    ///
    /// Starts the timeout sweep and connection health check, so it must be
    /// called within a tokio runtime.
    ///
    /// # Arguments
    /// * `config` - Client configuration
    /// * `discovery` - Source of provider addresses
    ///
    /// # Example
    /// ```no_run
    /// # use abrpc_orchestrator::{ClientConfig, Orchestrator, StaticDiscovery};
    /// # use std::sync::Arc;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let discovery = Arc::new(StaticDiscovery::with_services(["Echo"], vec!["127.0.0.1:9000".to_string()]));
    /// let orchestrator = Orchestrator::new(ClientConfig::default(), discovery)?;
    ///
    /// let pong = orchestrator.invoke("Echo", "ping", vec![]).await?;
    /// assert_eq!(pong, serde_json::json!("pong"));
    /// orchestrator.shutdown();
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(config: ClientConfig, discovery: Arc<dyn ServiceDiscovery>) -> Result<Self> {
        Self::with_serializers(config, discovery, Arc::new(SerializerRegistry::new()))
    }

    /// Creates an orchestrator that picks its serializer from `serializers`.
    ///
    /// # Errors
    /// Fails if the configured serializer or load-balance strategy is unknown.
    pub fn with_serializers(
        config: ClientConfig,
        discovery: Arc<dyn ServiceDiscovery>,
        serializers: Arc<SerializerRegistry>,
    ) -> Result<Self> {
        let serializer = serializers.by_name(&config.serializer)?;
        let codec = FrameCodec::new(Role::Client, serializers, serializer.type_id())?;
        let balancer = load_balancer_by_name(&config.load_balance)?;

        let futures = Arc::new(FutureManager::new(config.future_manager_config()));
        let connections =
            Arc::new(ConnectionManager::new(config.connection_manager_config(), futures.clone()).with_codec(codec));
        futures.start();
        connections.start();

        info!(
            serializer = serializer.name(),
            load_balance = balancer.name(),
            "Orchestrator initialized with circuit breaking and retry logic"
        );

        Ok(Self {
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            config,
            futures,
            connections,
            discovery,
            balancer,
            subscribed: DashSet::new(),
            calls: DashMap::new(),
        })
    }

    /// Replaces the load-balance strategy chosen by configuration.
    pub fn with_load_balance(mut self, balancer: Arc<dyn LoadBalance>) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn futures(&self) -> &Arc<FutureManager> {
        &self.futures
    }

    /// The breaker guarding `interface`, if it has been called.
    pub fn breaker(&self, interface: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(interface)
    }

    /// Typed call surface for one interface.
    pub fn proxy(&self, interface: impl Into<String>) -> ServiceProxy<'_> {
        ServiceProxy::new(self, interface)
    }

    /// Calls `interface.method(params)` and returns the result value.
    ///
    /// A successful call without a result yields `null`.
    pub async fn invoke(&self, interface: &str, method: &str, params: Vec<RpcValue>) -> Result<RpcValue> {
        let response = self.invoke_request(Request::new(interface, method, params)).await?;
        Ok(response.result.unwrap_or(RpcValue::Null))
    }

    /// Sends a prepared request with circuit breaking and retries.
    ///
    /// The request's id identifies the logical call for [`cancel`](Self::cancel);
    /// each retry goes out under a fresh id so a late response to an earlier
    /// attempt can't be mistaken for the current one.
    ///
    /// # Returns
    /// - `Ok(response)` - Successful (2xx) response
    /// - `Err(CircuitOpen)` - Breaker rejected the call, nothing was sent
    /// - `Err(Remote)` - Provider answered with a non-success code
    /// - `Err(RetriesExhausted)` - Every attempt failed transiently
    /// - `Err(Timeout | Closed | ...)` - Single failed attempt, no retries left
    pub async fn invoke_request(&self, request: Request) -> Result<Response> {
        let call_id = request.id.clone();
        let cancelled = CancellationToken::new();
        match self.calls.entry(call_id.clone()) {
            Entry::Occupied(_) => return Err(AbrpcError::DuplicateRequest(call_id)),
            Entry::Vacant(slot) => {
                slot.insert(CallState {
                    attempt_id: call_id.clone(),
                    cancelled: cancelled.clone(),
                });
            }
        }
        let _call = CallEntry {
            calls: &self.calls,
            id: call_id.clone(),
        };

        self.invoke_with_retry(&call_id, request, &cancelled).await
    }

    async fn invoke_with_retry(
        &self,
        call_id: &str,
        request: Request,
        cancelled: &CancellationToken,
    ) -> Result<Response> {
        let breaker = self.breakers.get_or_create(&request.interface);
        let mut ctx = RetryContext::new();
        let mut request = request;

        loop {
            if ctx.attempts() > 0 {
                request = request.reissue();
                match self.calls.get_mut(call_id) {
                    Some(mut current) => current.attempt_id = request.id.clone(),
                    None => return Err(AbrpcError::Cancelled(call_id.to_string())),
                }
            }
            if cancelled.is_cancelled() {
                return Err(AbrpcError::Cancelled(call_id.to_string()));
            }

            if !breaker.allow_request() {
                debug!(interface = %request.interface, method = %request.method, "Circuit open, rejecting call");
                return Err(AbrpcError::CircuitOpen(breaker.name().to_string()));
            }

            ctx.record_attempt();
            // A response that already arrived wins over a concurrent cancel
            let outcome = tokio::select! {
                biased;
                outcome = self.attempt(&request) => outcome,
                _ = cancelled.cancelled() => {
                    // The attempt may have registered after cancel() looked for it
                    self.futures.cancel(&request.id);
                    return Err(AbrpcError::Cancelled(call_id.to_string()));
                }
            };
            let err = match outcome {
                Ok(response) => {
                    breaker.record_success();
                    return Ok(response);
                }
                Err(err) => err,
            };

            if err.is_transient() {
                breaker.record_failure();
            } else if matches!(err, AbrpcError::Remote { .. }) {
                // The provider answered; a client-class code says nothing about its health
                breaker.record_success();
            }

            if !self.config.retry.should_retry(&err, &ctx) {
                if err.is_transient() && ctx.attempts() > 1 {
                    return Err(AbrpcError::RetriesExhausted {
                        attempts: ctx.attempts(),
                        source: Box::new(err),
                    });
                }
                return Err(err);
            }
            if cancelled.is_cancelled() {
                return Err(AbrpcError::Cancelled(call_id.to_string()));
            }

            let delay = self.config.retry.delay_for(ctx.attempts() - 1, &err);
            warn!(
                interface = %request.interface,
                method = %request.method,
                attempt = ctx.attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Call failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled.cancelled() => return Err(AbrpcError::Cancelled(call_id.to_string())),
            }
        }
    }

    /// One attempt: discover, select, connect, invoke.
    async fn attempt(&self, request: &Request) -> Result<Response> {
        let candidates = self.discovery.discover(&request.interface).await?;
        if candidates.is_empty() {
            return Err(AbrpcError::NoProvider(request.interface.clone()));
        }
        self.ensure_subscribed(&request.interface, &candidates);

        let addr = self
            .balancer
            .select(&candidates, request)
            .ok_or_else(|| AbrpcError::NoProvider(request.interface.clone()))?;
        let conn = self.connections.get(&addr).await?;

        let response = conn.invoke(request.clone()).await?;
        match response.status_class() {
            StatusClass::Success => Ok(response),
            _ => Err(AbrpcError::Remote {
                code: response.code,
                message: response.message.unwrap_or_default(),
            }),
        }
    }

    /// Drops cached connections to providers that vanish from discovery.
    fn ensure_subscribed(&self, service: &str, current: &[String]) {
        if !self.subscribed.insert(service.to_string()) {
            return;
        }

        let connections = Arc::downgrade(&self.connections);
        let known = Mutex::new(current.to_vec());
        self.discovery.subscribe(
            service,
            Arc::new(move |addresses: &[String]| {
                let Some(connections) = connections.upgrade() else { return };
                let mut known = known.lock().unwrap_or_else(PoisonError::into_inner);
                for gone in known.iter().filter(|addr| !addresses.contains(*addr)) {
                    if connections.remove(gone) {
                        info!(addr = %gone, "Provider left discovery, connection closed");
                    }
                }
                *known = addresses.to_vec();
            }),
        );
    }

    /// Cancels a call started with [`invoke_request`](Self::invoke_request).
    ///
    /// The call fails with `Cancelled` unless its response already won,
    /// whether it is waiting on a provider, still discovering or connecting,
    /// or backing off before a retry. Returns `false` if no such call is in
    /// progress.
    pub fn cancel(&self, call_id: &str) -> bool {
        match self.calls.remove(call_id) {
            Some((_, call)) => {
                self.futures.cancel(&call.attempt_id);
                call.cancelled.cancel();
                debug!(call_id, attempt_id = %call.attempt_id, "Call cancelled");
                true
            }
            None => false,
        }
    }

    /// Fails pending calls, stops background tasks and closes all connections.
    pub fn shutdown(&self) {
        self.futures.shutdown();
        self.connections.shutdown_all();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Unregisters a logical call however its future ends.
struct CallEntry<'a> {
    calls: &'a DashMap<RequestId, CallState>,
    id: RequestId,
}

impl Drop for CallEntry<'_> {
    fn drop(&mut self) {
        self.calls.remove(&self.id);
    }
}

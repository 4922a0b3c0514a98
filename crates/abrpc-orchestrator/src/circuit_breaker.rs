use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests flow through
    Closed,
    /// Circuit is tripped, requests fail fast without reaching a provider
    Open,
    /// Testing whether the target has recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Fraction of the probe budget that must succeed to close again
    pub success_rate_threshold: f64,
    /// How long the circuit stays open before probing (milliseconds)
    pub reset_timeout_ms: u64,
    /// Probe requests admitted per half-open window
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_rate_threshold: 0.5,
            reset_timeout_ms: 30_000,
            max_half_open_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_requests: u32,
    last_failure: Option<Instant>,
    /// When the current state was entered
    since: Instant,
}

/// Three-state admission gate for one logical target.
///
/// All methods lock the same state, so transitions triggered from the
/// caller's task (`allow_request`) and from completion callbacks
/// (`record_*`) never interleave. Counters reset on every state change.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_requests: 0,
                last_failure: None,
                since: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.lock().last_failure
    }

    /// Whether a request may proceed.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// here, and this call is counted as its first probe. A half-open
    /// window whose probes never reported back is restarted after another
    /// reset timeout so the breaker can't wedge.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();
        let reset_timeout = self.config.reset_timeout();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed > reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.half_open_requests = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.max_half_open_requests {
                    inner.half_open_requests += 1;
                    true
                } else if now.saturating_duration_since(inner.since) > reset_timeout {
                    debug!(breaker = %self.name, "Half-open probes stalled, restarting probe window");
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.half_open_requests = 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                let budget = self.config.max_half_open_requests.max(1);
                let rate = inner.success_count as f64 / budget as f64;
                if rate >= self.config.success_rate_threshold {
                    self.transition(&mut inner, CircuitState::Closed, Instant::now());
                }
            }
            // Completion of a request admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker back to closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed, Instant::now());
        inner.last_failure = None;
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) {
        if inner.state != to {
            info!(breaker = %self.name, from = ?inner.state, to = ?to, "Circuit breaker transition");
        }
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_requests = 0;
        inner.since = now;
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lazily populated breakers, one per target, kept for the client's lifetime.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(target) {
            return breaker.clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| b.clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

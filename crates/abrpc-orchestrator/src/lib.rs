//! Consumer-side invocation for abrpc.
//!
//! [`Orchestrator`] turns a method call into a request, gates it through a
//! per-interface [`CircuitBreaker`], picks a provider via [`ServiceDiscovery`]
//! and [`LoadBalance`], and retries transient failures per [`RetryConfig`].

pub mod circuit_breaker;
pub mod config;
pub mod discovery;
pub mod load_balancer;
pub mod orchestrator;
pub mod proxy;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use config::ClientConfig;
pub use discovery::{AddressListener, ServiceDiscovery, StaticDiscovery};
pub use load_balancer::{load_balancer_by_name, LoadBalance, RandomBalance, RoundRobinBalance};
pub use orchestrator::Orchestrator;
pub use proxy::ServiceProxy;
pub use retry::{RetryConfig, RetryContext};

use std::sync::Arc;

use abrpc_common::protocol::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// Callback invoked with the full, current address list of a service.
pub type AddressListener = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Source of provider addresses for a service.
///
/// The orchestrator only consumes address lists; how they are obtained
/// (a registry, DNS, a static file) is up to the implementation.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Current provider addresses for `service`, possibly empty.
    async fn discover(&self, service: &str) -> Result<Vec<String>>;

    /// Registers `listener` to be called whenever the address list changes.
    fn subscribe(&self, service: &str, listener: AddressListener);

    async fn is_healthy(&self, service: &str) -> bool;
}

/// In-memory discovery with addresses set by the owner.
///
/// Used for fixed deployments and in tests.
///
/// # Example
///
/// ```rust
/// use abrpc_orchestrator::{ServiceDiscovery, StaticDiscovery};
///
/// # #[tokio::main]
/// # async fn main() {
/// let discovery = StaticDiscovery::new();
/// discovery.set_addresses("Echo", vec!["127.0.0.1:9000".to_string()]);
/// assert_eq!(discovery.discover("Echo").await.unwrap().len(), 1);
/// # }
/// ```
#[derive(Default)]
pub struct StaticDiscovery {
    services: DashMap<String, Vec<String>>,
    listeners: DashMap<String, Vec<AddressListener>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a discovery where every listed service maps to the same addresses.
    pub fn with_services<I, S>(services: I, addresses: Vec<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let discovery = Self::new();
        for service in services {
            discovery.services.insert(service.into(), addresses.clone());
        }
        discovery
    }

    /// Replaces the addresses of `service` and notifies its subscribers.
    pub fn set_addresses(&self, service: &str, addresses: Vec<String>) {
        self.services.insert(service.to_string(), addresses.clone());
        debug!(service, addresses = addresses.len(), "Service addresses updated");

        // Clone out so listeners run without holding the map lock
        let listeners: Vec<AddressListener> = self
            .listeners
            .get(service)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for listener in listeners {
            listener(&addresses);
        }
    }

    pub fn subscriber_count(&self, service: &str) -> usize {
        self.listeners.get(service).map(|entry| entry.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn discover(&self, service: &str) -> Result<Vec<String>> {
        Ok(self
            .services
            .get(service)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    fn subscribe(&self, service: &str, listener: AddressListener) {
        self.listeners.entry(service.to_string()).or_default().push(listener);
    }

    async fn is_healthy(&self, service: &str) -> bool {
        self.services
            .get(service)
            .map(|entry| !entry.is_empty())
            .unwrap_or(false)
    }
}

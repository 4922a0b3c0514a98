use abrpc_common::protocol::error::Result;
use abrpc_common::protocol::{Request, RpcValue};
use serde::de::DeserializeOwned;

use crate::orchestrator::Orchestrator;

/// Method-call surface for one remote interface.
///
/// Obtained from [`Orchestrator::proxy`]. Every call goes through the
/// orchestrator's breaker and retry policy; only the result value or a
/// typed error comes back.
///
/// # Example
///
/// ```no_run
/// # use abrpc_orchestrator::{ClientConfig, Orchestrator, StaticDiscovery};
/// # use serde_json::json;
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let discovery = Arc::new(StaticDiscovery::new());
/// let orchestrator = Orchestrator::new(ClientConfig::default(), discovery)?;
/// let echo = orchestrator.proxy("Echo").with_timeout(1_000);
///
/// let reply: String = echo.call_as("echo", vec![json!("hello")]).await?;
/// assert_eq!(reply, "hello");
/// # Ok(())
/// # }
/// ```
pub struct ServiceProxy<'a> {
    orchestrator: &'a Orchestrator,
    interface: String,
    timeout_ms: Option<u64>,
}

impl<'a> ServiceProxy<'a> {
    pub(crate) fn new(orchestrator: &'a Orchestrator, interface: impl Into<String>) -> Self {
        Self {
            orchestrator,
            interface: interface.into(),
            timeout_ms: None,
        }
    }

    /// Applies a per-request timeout to every call made through this proxy.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub async fn call(&self, method: &str, params: Vec<RpcValue>) -> Result<RpcValue> {
        self.send(self.request(method, params)).await
    }

    /// Calls an overloaded method, selecting the overload by parameter types.
    pub async fn call_with_types(&self, method: &str, param_types: &[&str], params: Vec<RpcValue>) -> Result<RpcValue> {
        let request = self.request(method, params).with_param_types(param_types.iter().copied());
        self.send(request).await
    }

    /// Calls `method` and deserializes the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Vec<RpcValue>) -> Result<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn request(&self, method: &str, params: Vec<RpcValue>) -> Request {
        let request = Request::new(self.interface.as_str(), method, params);
        match self.timeout_ms {
            Some(timeout_ms) => request.with_timeout(timeout_ms),
            None => request,
        }
    }

    async fn send(&self, request: Request) -> Result<RpcValue> {
        let response = self.orchestrator.invoke_request(request).await?;
        Ok(response.result.unwrap_or(RpcValue::Null))
    }
}

//! Method dispatch table
//!
//! Maps `(interface, method, parameter types)` to a handler. The table is
//! filled once at startup and then shared read-only by every connection,
//! so lookups take no locks.
//!
//! # Overload Resolution
//!
//! - A request carrying parameter types selects the overload with exactly
//!   that signature.
//! - A request without types uses the only overload if there is one, or
//!   the single overload whose arity matches the parameter count.
//! - Anything else is rejected: an unknown name or signature with 404, an
//!   ambiguous untyped call with 400.
//!
//! # Example
//!
//! ```
//! use abrpc_server::MethodRegistry;
//! use serde_json::json;
//!
//! let mut registry = MethodRegistry::new();
//! registry
//!     .register_fn("Echo", "ping", |_| Ok(json!("pong")))
//!     .register_fn("Echo", "echo", |params| Ok(params.into_iter().next().unwrap_or_default()));
//!
//! assert!(registry.contains("Echo", "ping"));
//! assert_eq!(registry.len(), 2);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use abrpc_common::protocol::error::{AbrpcError, Result};
use abrpc_common::protocol::{status, Request, Response, RpcValue};
use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use tracing::warn;

/// Boxed future returned by every registered handler
pub type HandlerFuture = BoxFuture<'static, Result<RpcValue>>;

type Handler = Arc<dyn Fn(Vec<RpcValue>) -> HandlerFuture + Send + Sync>;

struct Overload {
    param_types: Vec<String>,
    handler: Handler,
}

/// Explicit `(interface, method, parameter types) -> handler` table.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<(String, String), Vec<Overload>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async handler with no declared signature.
    pub fn register<F, Fut>(&mut self, interface: &str, method: &str, handler: F) -> &mut Self
    where
        F: Fn(Vec<RpcValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcValue>> + Send + 'static,
    {
        self.register_overload(interface, method, &[], handler)
    }

    /// Registers a synchronous handler with no declared signature.
    pub fn register_fn<F>(&mut self, interface: &str, method: &str, handler: F) -> &mut Self
    where
        F: Fn(Vec<RpcValue>) -> Result<RpcValue> + Send + Sync + 'static,
    {
        self.register(interface, method, move |params| future::ready(handler(params)))
    }

    /// Registers an async handler for one overload of `method`.
    ///
    /// Registering the same signature twice replaces the earlier handler.
    ///
    /// # Arguments
    /// * `interface` - Interface (service) name
    /// * `method` - Method name
    /// * `param_types` - Parameter type signature distinguishing overloads
    /// * `handler` - Receives the call's positional parameters
    pub fn register_overload<F, Fut>(
        &mut self,
        interface: &str,
        method: &str,
        param_types: &[&str],
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Vec<RpcValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcValue>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| handler(params).boxed());
        let param_types: Vec<String> = param_types.iter().map(|t| t.to_string()).collect();

        let overloads = self
            .methods
            .entry((interface.to_string(), method.to_string()))
            .or_default();
        match overloads.iter_mut().find(|o| o.param_types == param_types) {
            Some(existing) => {
                warn!(interface, method, ?param_types, "Replacing registered handler");
                existing.handler = handler;
            }
            None => overloads.push(Overload { param_types, handler }),
        }
        self
    }

    pub fn contains(&self, interface: &str, method: &str) -> bool {
        self.methods.contains_key(&(interface.to_string(), method.to_string()))
    }

    /// Number of registered overloads across all methods
    pub fn len(&self) -> usize {
        self.methods.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered interface names, sorted.
    pub fn interfaces(&self) -> Vec<String> {
        let mut interfaces: Vec<String> = self.methods.keys().map(|(iface, _)| iface.clone()).collect();
        interfaces.sort();
        interfaces.dedup();
        interfaces
    }

    fn resolve(&self, request: &Request) -> Result<Handler> {
        let name = format!("{}.{}", request.interface, request.method);
        let overloads = self
            .methods
            .get(&(request.interface.clone(), request.method.clone()))
            .ok_or_else(|| AbrpcError::MethodNotFound(name.clone()))?;

        if !request.param_types.is_empty() {
            return overloads
                .iter()
                .find(|o| o.param_types == request.param_types)
                .map(|o| o.handler.clone())
                .ok_or_else(|| {
                    AbrpcError::MethodNotFound(format!("{}({})", name, request.param_types.join(", ")))
                });
        }

        if let [only] = overloads.as_slice() {
            return Ok(only.handler.clone());
        }

        let mut by_arity = overloads
            .iter()
            .filter(|o| o.param_types.len() == request.params.len());
        match (by_arity.next(), by_arity.next()) {
            (Some(overload), None) => Ok(overload.handler.clone()),
            _ => Err(AbrpcError::InvalidRequest(format!(
                "ambiguous call to overloaded {} with {} parameters",
                name,
                request.params.len()
            ))),
        }
    }

    /// Resolves and runs the handler for `request`.
    ///
    /// Never fails: lookup and handler errors become error responses.
    pub async fn dispatch(&self, request: Request) -> Response {
        let handler = match self.resolve(&request) {
            Ok(handler) => handler,
            Err(e) => return error_response(request.id, &e),
        };

        let Request { id, params, .. } = request;
        match handler(params).await {
            Ok(result) => Response::success(id, result),
            Err(e) => error_response(id, &e),
        }
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<String> = self
            .methods
            .iter()
            .flat_map(|((iface, method), overloads)| {
                overloads
                    .iter()
                    .map(move |o| format!("{}.{}({})", iface, method, o.param_types.join(", ")))
            })
            .collect();
        methods.sort();
        f.debug_struct("MethodRegistry").field("methods", &methods).finish()
    }
}

/// Maps a dispatch or handler error onto a response status.
///
/// Handlers choose their own status by returning [`AbrpcError::Remote`].
pub fn error_response(id: impl Into<String>, err: &AbrpcError) -> Response {
    let code = match err {
        AbrpcError::Remote { code, message } => return Response::error(id, *code, message.clone()),
        AbrpcError::MethodNotFound(_) => status::NOT_FOUND,
        AbrpcError::InvalidRequest(_) | AbrpcError::JsonSerialization(_) | AbrpcError::Serialization(_) => {
            status::BAD_REQUEST
        }
        _ => status::INTERNAL_ERROR,
    };
    Response::error(id, code, err.to_string())
}

/// Deserializes positional parameter `index`.
///
/// A missing or mistyped parameter is an `InvalidRequest`, so the caller
/// gets a 400.
pub fn param<T: DeserializeOwned>(params: &[RpcValue], index: usize) -> Result<T> {
    let value = params
        .get(index)
        .ok_or_else(|| AbrpcError::InvalidRequest(format!("missing parameter {}", index)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| AbrpcError::InvalidRequest(format!("parameter {}: {}", index, e)))
}

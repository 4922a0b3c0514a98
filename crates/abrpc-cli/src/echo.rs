//! Built-in `Echo` service served by `abrpc serve`.

use std::time::Duration;

use abrpc_server::{param, MethodRegistry};
use serde_json::json;

/// Interface name of the built-in service
pub const ECHO_INTERFACE: &str = "Echo";

/// Builds the dispatch table for the `Echo` service.
///
/// - `ping()` returns `"pong"`
/// - `echo(x)` returns `x` (`null` without a parameter)
/// - `sleep(ms)` waits `ms` milliseconds, then returns `ms`
pub fn echo_registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry
        .register_fn(ECHO_INTERFACE, "ping", |_| Ok(json!("pong")))
        .register_fn(ECHO_INTERFACE, "echo", |params| {
            Ok(params.into_iter().next().unwrap_or_default())
        })
        .register(ECHO_INTERFACE, "sleep", |params| async move {
            let ms: u64 = param(&params, 0)?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        });
    registry
}

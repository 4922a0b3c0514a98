//! # abrpc CLI
//!
//! Command-line interface for abrpc.
//!
//! - `abrpc serve`: run a provider node exposing the built-in `Echo` service
//! - `abrpc call`: make one call and print the JSON result (for scripting)
//!
//! The pieces the binary is assembled from live here so they can be tested
//! without spawning processes.

pub mod echo;

use abrpc_common::protocol::RpcValue;
use anyhow::{Context, Result};

/// Parses the positional parameters of `abrpc call`.
///
/// A JSON array supplies the parameters in order; any other JSON value is
/// a single parameter. No argument means no parameters.
pub fn parse_params(raw: Option<&str>) -> Result<Vec<RpcValue>> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(Vec::new());
    };
    let value: RpcValue = serde_json::from_str(raw).context("Invalid JSON in params")?;
    Ok(match value {
        RpcValue::Array(params) => params,
        other => vec![other],
    })
}

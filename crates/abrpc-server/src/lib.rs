//! abrpc Server
//!
//! This crate provides the provider side of abrpc: an explicit method
//! dispatch table and the node that serves it over the frame protocol.

pub mod dispatch;
pub mod node;

pub use dispatch::{error_response, param, HandlerFuture, MethodRegistry};
pub use node::{Node, NodeHandle};

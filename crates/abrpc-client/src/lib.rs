//! Client-side plumbing for abrpc.
//!
//! - [`FutureManager`] correlates responses with pending requests and
//!   enforces per-request timeouts
//! - [`Connection`] multiplexes many concurrent requests over one transport
//! - [`ConnectionManager`] caches one connection per provider address and
//!   keeps them healthy

pub mod connection;
pub mod connection_manager;
pub mod future_manager;

pub use connection::Connection;
pub use connection_manager::{ConnectionManager, ConnectionManagerConfig};
pub use future_manager::{completion_channel, Completion, FutureManager, FutureManagerConfig, ResponseFuture};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use abrpc_common::protocol::error::{AbrpcError, Result};
use abrpc_common::protocol::Request;
use rand::Rng;

/// Picks one provider address for a request.
pub trait LoadBalance: Send + Sync {
    /// Name used to select this strategy from configuration.
    fn name(&self) -> &'static str;

    /// Chooses among `candidates`; `None` only when there are none.
    fn select(&self, candidates: &[String], request: &Request) -> Option<String>;
}

/// Uniform random choice. The default strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBalance;

impl LoadBalance for RandomBalance {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, candidates: &[String], _request: &Request) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(index).cloned()
    }
}

/// Round-robin over the candidate list
#[derive(Debug, Default)]
pub struct RoundRobinBalance {
    next: AtomicUsize,
}

impl RoundRobinBalance {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RoundRobinBalance {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[String], _request: &Request) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let turn = self.next.fetch_add(1, Ordering::Relaxed);
        candidates.get(turn % candidates.len()).cloned()
    }
}

/// Looks up a load-balance strategy by its configuration name.
pub fn load_balancer_by_name(name: &str) -> Result<Arc<dyn LoadBalance>> {
    match name.to_ascii_lowercase().as_str() {
        "random" => Ok(Arc::new(RandomBalance)),
        "round_robin" | "roundrobin" => Ok(Arc::new(RoundRobinBalance::new())),
        other => Err(AbrpcError::InvalidRequest(format!(
            "unknown load balance strategy: {}",
            other
        ))),
    }
}

// src/load_balancer/round_robin.rs
use crate::error::ProxyError;
use crate::load_balancer::LoadBalancer;
use crate::proxy::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Cycles through the eligible set using one shared counter.
///
/// Every call takes a distinct ticket from `fetch_add`, so with a fixed
/// eligible set of `n` backends any `k * n` consecutive calls hit each
/// backend exactly `k` times, even under contention.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select_backend(&self, eligible: &[Arc<Backend>]) -> Result<Arc<Backend>, ProxyError> {
        if eligible.is_empty() {
            return Err(ProxyError::NoBackendAvailable);
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Ok(eligible[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

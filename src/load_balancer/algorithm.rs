// src/load_balancer/algorithm.rs
use crate::error::ProxyError;
use crate::proxy::Backend;
use std::sync::Arc;

/// Picks one backend from a caller-filtered eligible set.
///
/// Implementations must fail with [`ProxyError::NoBackendAvailable`] when
/// `eligible` is empty and must be safe to call from many tasks at once.
pub trait LoadBalancer: Send + Sync {
    fn select_backend(&self, eligible: &[Arc<Backend>]) -> Result<Arc<Backend>, ProxyError>;

    fn name(&self) -> &'static str;
}


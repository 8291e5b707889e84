//
// src/proxy/mod.rs
//
mod backend;
mod cache;
mod forward;
mod manager;
mod pool;
mod registry;

pub use backend::{Backend, BackendInfo};
pub use cache::{CachedResponse, MemoryResponseCache, ResponseCache};
pub use forward::{build_upstream_request, strip_hop_by_hop};
pub use manager::{ProxyManager, ProxyManagerBuilder, RequestContext};
pub use pool::{ConnectionPool, HttpClient, PoolStats, PooledClient};
pub use registry::BackendRegistry;

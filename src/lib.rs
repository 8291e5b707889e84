// src/lib.rs
pub mod config;
pub mod error;
pub mod server;
pub mod proxy;
pub mod load_balancer;
pub mod health;
pub mod circuit_breaker;
pub mod retry;
pub mod metrics;

pub use config::ProxyConfig;
pub use error::{AttemptError, ProxyError};
pub use proxy::{Backend, ProxyManager, RequestContext};

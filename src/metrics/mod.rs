// src/metrics/mod.rs
mod collector;
mod stats;

pub use collector::{MetricsCollector, MetricsRegistry};
pub use stats::{BackendStats, MetricsTracker, ProxyMetrics};

// src/metrics/stats.rs
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendStats {
    pub requests: u64,
    pub failures: u64,
    pub average_latency: Duration,
}

/// Point-in-time copy of the proxy counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_retries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub average_response_time: Duration,
    pub backend_metrics: HashMap<String, BackendStats>,
}

fn running_mean(average: Duration, sample: Duration, n: u64) -> Duration {
    if n == 0 {
        return average;
    }
    let average = average.as_secs_f64();
    let next = average + (sample.as_secs_f64() - average) / n as f64;
    Duration::from_secs_f64(next.max(0.0))
}

/// Counters behind a single lock so that a completion updates the counts
/// and the running mean together.
#[derive(Debug, Default)]
pub struct MetricsTracker {
    inner: Mutex<ProxyMetrics>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProxyMetrics> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one finished forward call, successful or not.
    ///
    /// The request is counted here rather than on arrival so that a `reset`
    /// racing an in-flight call can never leave more completions than
    /// requests.
    pub fn record_completion(&self, success: bool, latency: Duration) {
        let mut metrics = self.lock();
        metrics.total_requests += 1;
        if success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }
        let completed = metrics.successful_requests + metrics.failed_requests;
        metrics.average_response_time = running_mean(metrics.average_response_time, latency, completed);
    }

    pub fn record_retry(&self) {
        self.lock().total_retries += 1;
    }

    pub fn record_cache_hit(&self) {
        self.lock().cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.lock().cache_misses += 1;
    }

    pub fn record_backend_attempt(&self, backend_id: &str, success: bool, latency: Duration) {
        let mut metrics = self.lock();
        let stats = metrics
            .backend_metrics
            .entry(backend_id.to_string())
            .or_default();
        stats.requests += 1;
        if !success {
            stats.failures += 1;
        }
        stats.average_latency = running_mean(stats.average_latency, latency, stats.requests);
    }

    pub fn remove_backend(&self, backend_id: &str) {
        self.lock().backend_metrics.remove(backend_id);
    }

    pub fn snapshot(&self) -> ProxyMetrics {
        self.lock().clone()
    }

    pub fn reset(&self) {
        *self.lock() = ProxyMetrics::default();
    }
}

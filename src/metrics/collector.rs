// src/metrics/collector.rs
use crate::circuit_breaker::CircuitBreakerState;
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }
}

/// Prometheus sink fed by the proxy manager and the health checker.
pub struct MetricsCollector {
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,

    pub backend_requests_total: IntCounterVec,
    pub backend_request_duration_seconds: HistogramVec,
    pub backend_health_status: IntGaugeVec,
    pub backends: IntGaugeVec,

    pub retries_total: IntCounter,
    pub cache_lookups_total: IntCounterVec,
    pub circuit_breaker_state: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("proxy_requests_total", "Total number of forwarded requests"),
            &["method", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "proxy_request_duration_seconds",
                "End-to-end forward duration in seconds, retries included",
            ),
            &["method"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let backend_requests_total = IntCounterVec::new(
            Opts::new("proxy_backend_requests_total", "Attempts sent to each backend"),
            &["backend", "outcome"],
        )?;
        registry.register(Box::new(backend_requests_total.clone()))?;

        let backend_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "proxy_backend_request_duration_seconds",
                "Single attempt duration per backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_request_duration_seconds.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "proxy_backend_health_status",
                "Backend health status (1=healthy, 0=unhealthy)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let backends = IntGaugeVec::new(
            Opts::new("proxy_backends", "Registered backends by probe result"),
            &["state"],
        )?;
        registry.register(Box::new(backends.clone()))?;

        let retries_total = IntCounter::new("proxy_retries_total", "Retried forwarding attempts")?;
        registry.register(Box::new(retries_total.clone()))?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new("proxy_cache_lookups_total", "Response cache lookups"),
            &["result"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "proxy_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            backend_requests_total,
            backend_request_duration_seconds,
            backend_health_status,
            backends,
            retries_total,
            cache_lookups_total,
            circuit_breaker_state,
        })
    }

    pub fn record_request(&self, method: &str, status_code: u16, duration: Duration) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[method, &status])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[method])
            .observe(duration.as_secs_f64());
    }

    pub fn record_backend_request(&self, backend: &str, success: bool, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.backend_requests_total
            .with_label_values(&[backend, outcome])
            .inc();

        self.backend_request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_retry(&self) {
        self.retries_total.inc();
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[result]).inc();
    }

    pub fn update_backend_health(&self, backend: &str, healthy: bool) {
        let value = if healthy { 1 } else { 0 };
        self.backend_health_status
            .with_label_values(&[backend])
            .set(value);
    }

    pub fn update_circuit_breaker_state(&self, backend: &str, state: CircuitBreakerState) {
        let value = match state {
            CircuitBreakerState::Closed => 0,
            CircuitBreakerState::Open => 1,
            CircuitBreakerState::HalfOpen => 2,
        };

        self.circuit_breaker_state
            .with_label_values(&[backend])
            .set(value);
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.backends.with_label_values(&["healthy"]).set(healthy as i64);
        self.backends
            .with_label_values(&["unhealthy"])
            .set(total.saturating_sub(healthy) as i64);
    }

    /// Drop every per-backend series for a removed backend.
    pub fn remove_backend(&self, backend: &str) {
        let _ = self.backend_health_status.remove_label_values(&[backend]);
        let _ = self.circuit_breaker_state.remove_label_values(&[backend]);
        let _ = self.backend_request_duration_seconds.remove_label_values(&[backend]);
        for outcome in ["success", "failure"] {
            let _ = self.backend_requests_total.remove_label_values(&[backend, outcome]);
        }
    }
}

// ────────────────────────────────
// src/proxy/manager.rs
// Orchestrates selection, pooling, retries, circuit breaking and caching
// ────────────────────────────────

use super::backend::Backend;
use super::cache::{self, CachedResponse, MemoryResponseCache, ResponseCache};
use super::forward;
use super::pool::{ConnectionPool, PoolStats, PooledClient};
use super::registry::BackendRegistry;
use crate::circuit_breaker::{CircuitBreakerManager, CircuitBreakerState, CircuitSnapshot};
use crate::config::ProxyConfig;
use crate::error::{AttemptError, ProxyError};
use crate::health::{HealthChecker, HealthStatus};
use crate::load_balancer::{create_load_balancer, LoadBalancer};
use crate::metrics::{MetricsCollector, MetricsTracker, ProxyMetrics};
use crate::retry::{Backoff, RetryPolicy};
use hyper::body::Bytes;
use hyper::http::response;
use hyper::{Body, Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Caller-side limits for one forwarded request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub deadline: Option<Instant>,
    pub cancellation: CancellationToken,
    pub client_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

enum Upstream {
    Streaming(Response<Body>),
    Buffered(response::Parts, Bytes),
}

pub struct ProxyManagerBuilder {
    config: ProxyConfig,
    registry: Option<Arc<BackendRegistry>>,
    load_balancer: Option<Arc<dyn LoadBalancer>>,
    circuit_breaker: Option<Arc<CircuitBreakerManager>>,
    pool: Option<Arc<ConnectionPool>>,
    cache: Option<Arc<dyn ResponseCache>>,
    backoff: Option<Arc<dyn Backoff>>,
    collector: Option<Arc<MetricsCollector>>,
}

impl ProxyManagerBuilder {
    pub fn registry(mut self, registry: Arc<BackendRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn load_balancer(mut self, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        self.load_balancer = Some(load_balancer);
        self
    }

    pub fn circuit_breaker(mut self, circuit_breaker: Arc<CircuitBreakerManager>) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    pub fn connection_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Replaces the in-memory cache; only consulted when caching is enabled.
    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn metrics_collector(mut self, collector: Arc<MetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Validate the configuration and register its backends.
    pub fn build(self) -> Result<ProxyManager, ProxyError> {
        let config = self.config;
        config.validate()?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(BackendRegistry::new()));
        for backend in &config.backends {
            registry.add_backend(Backend::from_config(backend)?)?;
        }

        let load_balancer = self
            .load_balancer
            .unwrap_or_else(|| create_load_balancer(config.load_balancer.algorithm));
        let circuit_breaker = self
            .circuit_breaker
            .unwrap_or_else(|| Arc::new(CircuitBreakerManager::from_config(&config.circuit_breaker)));
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(ConnectionPool::new(config.pool.clone())));

        let mut retry = RetryPolicy::new(&config.retry);
        if let Some(backoff) = self.backoff {
            retry = retry.with_backoff(backoff);
        }

        let cache = if config.cache.enabled {
            Some(
                self.cache
                    .unwrap_or_else(|| Arc::new(MemoryResponseCache::new()) as Arc<dyn ResponseCache>),
            )
        } else {
            None
        };

        let health_checker = HealthChecker::new(
            config.health_check.clone(),
            registry.clone(),
            self.collector.clone(),
        )
        .map_err(|e| ProxyError::Configuration(format!("health check client: {}", e)))?;

        Ok(ProxyManager {
            config,
            registry,
            load_balancer,
            circuit_breaker,
            pool,
            health_checker: Arc::new(health_checker),
            retry,
            cache,
            metrics: MetricsTracker::new(),
            collector: self.collector,
        })
    }
}

pub struct ProxyManager {
    config: ProxyConfig,
    registry: Arc<BackendRegistry>,
    load_balancer: Arc<dyn LoadBalancer>,
    circuit_breaker: Arc<CircuitBreakerManager>,
    pool: Arc<ConnectionPool>,
    health_checker: Arc<HealthChecker>,
    retry: RetryPolicy,
    cache: Option<Arc<dyn ResponseCache>>,
    metrics: MetricsTracker,
    collector: Option<Arc<MetricsCollector>>,
}

impl ProxyManager {
    pub fn builder(config: ProxyConfig) -> ProxyManagerBuilder {
        ProxyManagerBuilder {
            config,
            registry: None,
            load_balancer: None,
            circuit_breaker: None,
            pool: None,
            cache: None,
            backoff: None,
            collector: None,
        }
    }

    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Forward `req` to one of the eligible backends.
    ///
    /// Transient failures are retried internally; only the final outcome is
    /// returned.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let started = Instant::now();
        let method = req.method().clone();

        let result = self.forward_inner(ctx, req).await;

        let elapsed = started.elapsed();
        self.metrics.record_completion(result.is_ok(), elapsed);
        if let Some(collector) = &self.collector {
            let status = match &result {
                Ok(response) => response.status(),
                Err(e) => e.status_code(),
            };
            collector.record_request(method.as_str(), status.as_u16(), elapsed);
        }
        result
    }

    async fn forward_inner(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = req.into_parts();
        let body = hyper::body::to_bytes(body)
            .await
            .map_err(|e| ProxyError::InvalidRequest(format!("failed to read request body: {}", e)))?;

        let cache_key = match &self.cache {
            Some(_) if cache::is_cacheable_request(&parts.method, &parts.headers, &body) => {
                Some(cache::cache_key(&parts, &self.config.cache.vary_headers))
            }
            _ => None,
        };

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            let hit = cache.get(key).await;
            if let Some(collector) = &self.collector {
                collector.record_cache_lookup(hit.is_some());
            }
            if let Some(cached) = hit {
                self.metrics.record_cache_hit();
                debug!(uri = %parts.uri, "Serving response from cache");
                return Ok(cached.into_response());
            }
            self.metrics.record_cache_miss();
        }

        let mut eligible: Vec<Arc<Backend>> = self
            .registry
            .list_backends()
            .into_iter()
            .filter(|b| b.is_active() && !self.circuit_breaker.is_open(&b.id))
            .collect();

        if eligible.is_empty() {
            warn!(uri = %parts.uri, "No eligible backend for request");
            return Err(ProxyError::NoBackendAvailable);
        }

        let max_attempts = self.retry.max_attempts();
        let request_timeout = self.config.timeouts.request_timeout();
        let mut attempts = 0;
        let mut last_error: Option<AttemptError> = None;

        while attempts < max_attempts {
            // Backends removed since the eligible set was taken get no further attempts.
            eligible.retain(|b| self.is_registered(b));
            if eligible.is_empty() {
                if last_error.is_none() {
                    warn!(uri = %parts.uri, "Every eligible backend was removed before forwarding");
                    return Err(ProxyError::NoBackendAvailable);
                }
                break;
            }
            attempts += 1;

            let backend = self.load_balancer.select_backend(&eligible)?;
            let client = self.pool.get_connection(&backend.id)?;
            let request = forward::build_upstream_request(&parts, body.clone(), &backend, ctx.client_addr)?;
            let attempt_timeout = ctx
                .remaining()
                .map_or(request_timeout, |remaining| remaining.min(request_timeout));

            let attempt_started = Instant::now();
            let outcome = self
                .attempt(ctx, &client, request, attempt_timeout, cache_key.is_some())
                .await;
            let latency = attempt_started.elapsed();

            match outcome {
                Ok(upstream) => {
                    self.record_outcome(&backend, true, latency);
                    return Ok(self.finish(upstream, cache_key).await);
                }
                Err(cause) => {
                    self.record_outcome(&backend, false, latency);
                    debug!(backend = %backend.id, attempt = attempts, error = %cause, "Forward attempt failed");

                    if matches!(cause, AttemptError::Cancelled) {
                        return Err(ProxyError::Cancelled);
                    }
                    last_error = Some(cause);
                }
            }

            if attempts == max_attempts {
                break;
            }

            eligible.retain(|b| self.is_registered(b));
            if eligible.is_empty() {
                debug!(attempt = attempts, "No registered backend left to retry against");
                break;
            }

            let delay = self.retry.backoff(attempts);
            if ctx.remaining().map_or(false, |remaining| remaining <= delay) {
                debug!(attempt = attempts, "Deadline leaves no room for another attempt");
                break;
            }

            self.metrics.record_retry();
            if let Some(collector) = &self.collector {
                collector.record_retry();
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation.cancelled() => return Err(ProxyError::Cancelled),
            }
        }

        let last = last_error.unwrap_or(AttemptError::Transport("no attempt was made".into()));
        warn!(attempts, error = %last, "Retries exhausted");
        Err(ProxyError::RetryExhausted { attempts, last })
    }

    async fn attempt(
        &self,
        ctx: &RequestContext,
        client: &PooledClient,
        request: Request<Body>,
        timeout: Duration,
        buffer: bool,
    ) -> Result<Upstream, AttemptError> {
        let exchange = async {
            let response = client
                .send(request)
                .await
                .map_err(|e| AttemptError::Transport(e.to_string()))?;

            let status = response.status();
            if self.retry.is_retryable_status(status) {
                return Err(AttemptError::Status(status));
            }

            if buffer && cache::is_cacheable_response(status, response.headers()) {
                let (parts, body) = response.into_parts();
                let bytes = hyper::body::to_bytes(body)
                    .await
                    .map_err(|e| AttemptError::Transport(e.to_string()))?;
                return Ok(Upstream::Buffered(parts, bytes));
            }

            Ok::<Upstream, AttemptError>(Upstream::Streaming(response))
        };

        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(AttemptError::Cancelled),
            result = tokio::time::timeout(timeout, exchange) => {
                result.unwrap_or(Err(AttemptError::Timeout(timeout)))
            }
        }
    }

    async fn finish(&self, upstream: Upstream, cache_key: Option<String>) -> Response<Body> {
        match upstream {
            Upstream::Streaming(mut response) => {
                forward::strip_hop_by_hop(response.headers_mut());
                response
            }
            Upstream::Buffered(mut parts, bytes) => {
                forward::strip_hop_by_hop(&mut parts.headers);
                if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
                    let cached = CachedResponse {
                        status: parts.status,
                        headers: parts.headers.clone(),
                        body: bytes.clone(),
                    };
                    cache.set(key, cached, self.config.cache.ttl()).await;
                }
                Response::from_parts(parts, Body::from(bytes))
            }
        }
    }

    /// Whether `backend` is still the registered instance for its id.
    fn is_registered(&self, backend: &Arc<Backend>) -> bool {
        self.registry
            .get_backend(&backend.id)
            .map_or(false, |current| Arc::ptr_eq(&current, backend))
    }

    /// Feed one attempt's outcome to the circuit breaker and metrics.
    ///
    /// Outcomes for a backend that was removed (or removed and re-added)
    /// while the attempt ran are dropped, so they cannot recreate state that
    /// `remove_backend` already cleared.
    fn record_outcome(&self, backend: &Arc<Backend>, success: bool, latency: Duration) {
        if !self.is_registered(backend) {
            debug!(backend = %backend.id, "Backend removed during attempt, outcome discarded");
            self.discard_stale_state(&backend.id);
            return;
        }

        let state = if success {
            self.circuit_breaker.record_success(&backend.id)
        } else {
            self.circuit_breaker.record_failure(&backend.id)
        };
        self.metrics.record_backend_attempt(&backend.id, success, latency);
        if let Some(collector) = &self.collector {
            collector.record_backend_request(&backend.id, success, latency);
        }
        self.publish_circuit_state(&backend.id, state);

        // Removal may have landed between the check and the writes above.
        if !self.is_registered(backend) {
            self.discard_stale_state(&backend.id);
        }
    }

    /// Clear per-backend state only when no backend with this id is registered.
    fn discard_stale_state(&self, backend_id: &str) {
        if self.registry.get_backend(backend_id).is_none() {
            self.drop_backend_state(backend_id);
        }
    }

    fn drop_backend_state(&self, backend_id: &str) {
        self.pool.release(backend_id);
        self.circuit_breaker.remove(backend_id);
        self.health_checker.remove(backend_id);
        self.metrics.remove_backend(backend_id);
        if let Some(collector) = &self.collector {
            collector.remove_backend(backend_id);
        }
    }

    fn publish_circuit_state(&self, backend_id: &str, state: CircuitBreakerState) {
        if let Some(collector) = &self.collector {
            collector.update_circuit_breaker_state(backend_id, state);
        }
    }

    // ── Backend administration ──────────────────────────

    /// Register a backend. A re-used id starts from clean circuit, pool and
    /// metrics state.
    pub fn add_backend(&self, backend: Backend) -> Result<Arc<Backend>, ProxyError> {
        self.discard_stale_state(&backend.id);
        self.registry.add_backend(backend)
    }

    /// Unregister a backend and drop every piece of per-backend state.
    pub fn remove_backend(&self, backend_id: &str) -> Result<Arc<Backend>, ProxyError> {
        let removed = self.registry.remove_backend(backend_id)?;
        self.drop_backend_state(backend_id);
        Ok(removed)
    }

    pub fn get_backend(&self, backend_id: &str) -> Option<Arc<Backend>> {
        self.registry.get_backend(backend_id)
    }

    pub fn list_backends(&self) -> Vec<Arc<Backend>> {
        self.registry.list_backends()
    }

    pub fn set_backend_active(&self, backend_id: &str, active: bool) -> Result<(), ProxyError> {
        self.registry.set_active(backend_id, active)
    }

    pub fn circuit_state(&self, backend_id: &str) -> CircuitBreakerState {
        self.circuit_breaker.get_state(backend_id)
    }

    pub fn circuit_snapshot(&self) -> HashMap<String, CircuitSnapshot> {
        self.circuit_breaker.snapshot()
    }

    pub fn reset_circuit(&self, backend_id: &str) -> Result<(), ProxyError> {
        if self.registry.get_backend(backend_id).is_none() {
            return Err(ProxyError::NotFound(backend_id.to_string()));
        }
        self.circuit_breaker.reset(backend_id);
        self.publish_circuit_state(backend_id, CircuitBreakerState::Closed);
        Ok(())
    }

    // ── Metrics, health and lifecycle ───────────────────

    pub fn get_metrics(&self) -> ProxyMetrics {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn health_check(&self) {
        self.health_checker.health_check().await;
    }

    pub fn get_health_status(&self) -> HashMap<String, HealthStatus> {
        self.health_checker.get_health_status()
    }

    /// Spawn the periodic health loop when enabled in the configuration.
    pub fn start_health_checker(&self) -> Option<JoinHandle<()>> {
        if !self.config.health_check.enabled {
            tracing::info!("Active health checks disabled");
            return None;
        }
        Some(tokio::spawn(self.health_checker.clone().start()))
    }

    /// Stop the health loop and release every pooled client.
    pub fn shutdown(&self) {
        self.health_checker.shutdown();
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use url::Url;

    fn config_with(backends: Vec<(&str, &str)>) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.health_check.enabled = false;
        config.backends = backends
            .into_iter()
            .map(|(id, url)| BackendConfig {
                id: id.to_string(),
                url: url.to_string(),
                weight: 1,
                active: true,
                health_check_path: "/".to_string(),
            })
            .collect();
        config
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_request_context_remaining() {
        let ctx = RequestContext::new();
        assert!(ctx.remaining().is_none());

        let ctx = RequestContext::new().with_timeout(Duration::from_secs(5));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(4));

        let past = RequestContext::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(past.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_build_registers_configured_backends() {
        let manager = ProxyManager::new(config_with(vec![
            ("b1", "http://127.0.0.1:9001"),
            ("b2", "http://127.0.0.1:9002"),
        ]))
        .unwrap();

        let ids: Vec<String> = manager.list_backends().iter().map(|b| b.id.clone()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = ProxyManager::new(config_with(vec![
            ("b1", "http://127.0.0.1:9001"),
            ("b1", "http://127.0.0.1:9002"),
        ]));
        assert!(matches!(result, Err(ProxyError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_forward_without_backends() {
        let manager = ProxyManager::new(config_with(vec![])).unwrap();

        let result = manager.forward(&RequestContext::new(), get("/")).await;
        assert!(matches!(result, Err(ProxyError::NoBackendAvailable)));

        let metrics = manager.get_metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(manager.pool_stats().total_connections, 0);
    }

    #[tokio::test]
    async fn test_forward_skips_inactive_and_open_backends() {
        let mut config = config_with(vec![
            ("off", "http://127.0.0.1:9001"),
            ("tripped", "http://127.0.0.1:9002"),
        ]);
        config.circuit_breaker.failure_threshold = 1;
        let manager = ProxyManager::new(config).unwrap();

        manager.set_backend_active("off", false).unwrap();
        manager.circuit_breaker.record_failure("tripped");
        assert_eq!(manager.circuit_state("tripped"), CircuitBreakerState::Open);

        let result = manager.forward(&RequestContext::new(), get("/")).await;
        assert!(matches!(result, Err(ProxyError::NoBackendAvailable)));
    }

    #[test]
    fn test_reset_circuit_requires_registered_backend() {
        let mut config = config_with(vec![("b1", "http://127.0.0.1:9001")]);
        config.circuit_breaker.failure_threshold = 1;
        let manager = ProxyManager::new(config).unwrap();

        manager.circuit_breaker.record_failure("b1");
        manager.reset_circuit("b1").unwrap();
        assert_eq!(manager.circuit_state("b1"), CircuitBreakerState::Closed);

        assert!(matches!(
            manager.reset_circuit("ghost"),
            Err(ProxyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_backend_drops_per_backend_state() {
        let manager = ProxyManager::new(config_with(vec![("b1", "http://127.0.0.1:9001")])).unwrap();
        manager.pool.get_connection("b1").unwrap();
        manager.circuit_breaker.record_failure("b1");

        manager.remove_backend("b1").unwrap();

        assert!(manager.get_backend("b1").is_none());
        assert_eq!(manager.pool_stats().total_connections, 0);
        assert!(manager.circuit_snapshot().is_empty());
        assert!(matches!(
            manager.remove_backend("b1"),
            Err(ProxyError::NotFound(_))
        ));

        manager
            .add_backend(Backend::new("b1", Url::parse("http://127.0.0.1:9001").unwrap()))
            .unwrap();
        assert_eq!(manager.circuit_state("b1"), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_health_checker_not_started_when_disabled() {
        let manager = ProxyManager::new(config_with(vec![])).unwrap();
        assert!(manager.start_health_checker().is_none());
    }
}

// src/config/models.rs
use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

/// Root configuration. `ProxyConfig::default()` carries the documented defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub backends: Vec<BackendConfig>,
    pub load_balancer: LoadBalancerConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health_check: HealthCheckConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub timeouts: TimeoutConfig,
    pub metrics: MetricsConfig,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(ProxyError::Configuration("backend id must not be empty".into()));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(ProxyError::Configuration(format!(
                    "backend id {} is declared twice",
                    backend.id
                )));
            }
            let url = Url::parse(&backend.url).map_err(|e| {
                ProxyError::Configuration(format!("backend {}: invalid url: {}", backend.id, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                return Err(ProxyError::Configuration(format!(
                    "backend {}: url must be an absolute http(s) url",
                    backend.id
                )));
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ProxyError::Configuration(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.cache.enabled && self.cache.ttl_secs == 0 {
            return Err(ProxyError::Configuration(
                "cache.ttl_secs must be positive when caching is enabled".into(),
            ));
        }
        if self.health_check.enabled && self.health_check.interval_secs == 0 {
            return Err(ProxyError::Configuration(
                "health_check.interval_secs must be positive when health checks are enabled".into(),
            ));
        }
        if self.health_check.enabled && self.health_check.timeout_secs == 0 {
            return Err(ProxyError::Configuration(
                "health_check.timeout_secs must be positive when health checks are enabled".into(),
            ));
        }
        if self.health_check.enabled && self.health_check.timeout_secs > self.health_check.interval_secs {
            return Err(ProxyError::Configuration(
                "health_check.timeout_secs must not exceed interval_secs".into(),
            ));
        }
        if self.timeouts.request_timeout_ms == 0 {
            return Err(ProxyError::Configuration(
                "timeouts.request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
}

fn default_weight() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

fn default_health_check_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerAlgorithm {
    #[default]
    RoundRobin,
    WeightedRandom,
    LeastConnections,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub algorithm: LoadBalancerAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential { max_delay_ms: u64 },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    /// Treat every 5xx as retryable.
    pub retry_server_errors: bool,
    /// Additional retryable statuses, e.g. 429.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
            backoff: BackoffKind::Fixed,
            retry_server_errors: true,
            retryable_status_codes: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// When unset, an open circuit only closes through a manual reset.
    ///
    /// Once the timeout passes the circuit reads as half-open and the backend
    /// is eligible again for every request, not a single trial request. The
    /// first recorded outcome then closes or re-opens it.
    pub recovery_timeout_secs: Option<u64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Option<Duration> {
        self.recovery_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 2,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Request headers folded into the cache key.
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 60,
            vary_headers: vec!["accept".to_string(), "accept-encoding".to_string()],
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub idle_timeout_secs: u64,
    pub max_idle_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 90,
            max_idle_per_host: 32,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for a single forwarding attempt.
    pub request_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, BackendRegistry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Latest probe outcome for one backend.
///
/// Purely informational: it never changes whether the backend is active.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub last_checked_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub response_time_ms: u64,
}

pub struct HealthChecker {
    config: HealthCheckConfig,
    registry: Arc<BackendRegistry>,
    client: Client,
    statuses: DashMap<String, HealthStatus>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        registry: Arc<BackendRegistry>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent("upstream-proxy-health-check")
            .build()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Ok(Self {
            config,
            registry,
            client,
            statuses: DashMap::new(),
            metrics,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Probe on `interval` until [`shutdown`](Self::shutdown) is called.
    pub async fn start(self: Arc<Self>) {
        if self.config.interval().is_zero() {
            error!("Health check interval must be positive, health checker not started");
            return;
        }

        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            "Starting health checker with interval: {:?}",
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.health_check().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Probe every registered backend once, concurrently.
    pub async fn health_check(&self) {
        let backends = self.registry.list_backends();
        let probes = backends.iter().map(|backend| self.check_backend(backend));
        let results = futures::future::join_all(probes).await;

        let mut healthy_count = 0;
        for (backend, status) in backends.iter().zip(results) {
            let previous = self
                .statuses
                .insert(backend.id.clone(), status.clone())
                .map(|s| s.is_healthy);

            if status.is_healthy {
                healthy_count += 1;
                debug!(backend = %backend.id, "Backend is healthy");
                if previous == Some(false) {
                    info!(backend = %backend.id, "Backend recovered");
                }
            } else if previous != Some(false) {
                warn!(backend = %backend.id, error = ?status.last_error, "Backend is unhealthy");
            }

            if let Some(metrics) = &self.metrics {
                metrics.update_backend_health(&backend.id, status.is_healthy);
            }
        }

        // A backend removed while probes were in flight must not linger.
        let current = self.registry.list_backends();
        let live: HashSet<&str> = current.iter().map(|b| b.id.as_str()).collect();
        self.statuses.retain(|id, _| live.contains(id.as_str()));

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_counts(healthy_count, backends.len());
        }

        info!(
            "Health check complete: {} healthy, {} unhealthy",
            healthy_count,
            backends.len() - healthy_count
        );
    }

    async fn check_backend(&self, backend: &Backend) -> HealthStatus {
        let start = std::time::Instant::now();
        let url = backend.health_check_url();

        let result = timeout(self.config.timeout(), self.client.get(&url).send()).await;

        let (is_healthy, last_error) = match result {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_success() {
                    (true, None)
                } else {
                    (false, Some(format!("HTTP {}", status)))
                }
            }
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("Request timeout".to_string())),
        };

        HealthStatus {
            is_healthy,
            last_checked_at: Utc::now(),
            last_error,
            response_time_ms: start.elapsed().as_millis() as u64,
        }
    }

    pub fn get_health_status(&self) -> HashMap<String, HealthStatus> {
        self.statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn remove(&self, backend_id: &str) {
        self.statuses.remove(backend_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn registry_with(backends: Vec<Backend>) -> Arc<BackendRegistry> {
        let registry = Arc::new(BackendRegistry::new());
        for backend in backends {
            registry.add_backend(backend).unwrap();
        }
        registry
    }

    fn fast_config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_secs: 1,
            timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_health_check_records_status_without_touching_activity() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/healthz")
            .with_status(200)
            .create_async()
            .await;
        let failing = server
            .mock("GET", "/broken")
            .with_status(503)
            .create_async()
            .await;

        let url = Url::parse(&server.url()).unwrap();
        let registry = registry_with(vec![
            Backend::new("up", url.clone()).with_health_check_path("/healthz"),
            Backend::new("down", url).with_health_check_path("/broken"),
        ]);
        let checker = HealthChecker::new(fast_config(), registry.clone(), None).unwrap();

        checker.health_check().await;

        let statuses = checker.get_health_status();
        assert!(statuses["up"].is_healthy);
        assert!(statuses["up"].last_error.is_none());
        assert!(!statuses["down"].is_healthy);
        assert_eq!(statuses["down"].last_error.as_deref(), Some("HTTP 503 Service Unavailable"));

        // Health is informational only.
        assert!(registry.get_backend("down").unwrap().is_active());

        ok.assert_async().await;
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unhealthy() {
        let registry = registry_with(vec![Backend::new(
            "gone",
            Url::parse("http://127.0.0.1:1").unwrap(),
        )]);
        let checker = HealthChecker::new(fast_config(), registry, None).unwrap();

        checker.health_check().await;

        let status = &checker.get_health_status()["gone"];
        assert!(!status.is_healthy);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_removed_backend_status_is_dropped() {
        let mut server = mockito::Server::new_async().await;
        let _ok = server.mock("GET", "/").with_status(200).create_async().await;

        let registry = registry_with(vec![Backend::new("a", Url::parse(&server.url()).unwrap())]);
        let checker = HealthChecker::new(fast_config(), registry.clone(), None).unwrap();
        checker.health_check().await;
        assert_eq!(checker.get_health_status().len(), 1);

        registry.remove_backend("a").unwrap();
        checker.remove("a");
        assert!(checker.get_health_status().is_empty());
    }

    #[tokio::test]
    async fn test_start_returns_on_zero_interval() {
        let config = HealthCheckConfig {
            enabled: true,
            interval_secs: 0,
            timeout_secs: 0,
        };
        let checker = Arc::new(HealthChecker::new(config, registry_with(vec![]), None).unwrap());

        tokio::time::timeout(std::time::Duration::from_secs(1), tokio::spawn(checker.start()))
            .await
            .expect("health loop did not return")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown() {
        let checker = Arc::new(HealthChecker::new(fast_config(), registry_with(vec![]), None).unwrap());
        let handle = tokio::spawn(checker.clone().start());

        checker.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("health loop did not stop")
            .unwrap();
    }
}

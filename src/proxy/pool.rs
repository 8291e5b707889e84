//
// src/proxy/pool.rs
//

use crate::config::PoolConfig;
use crate::error::ProxyError;
use dashmap::DashMap;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response};
use hyper_tls::HttpsConnector;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Long-lived client owned by the pool on behalf of one backend.
#[derive(Debug)]
pub struct PooledClient {
    backend_id: String,
    client: HttpClient,
    requests: AtomicU64,
}

impl PooledClient {
    fn new(backend_id: &str, config: &PoolConfig) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(config.idle_timeout())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build::<_, Body>(HttpsConnector::new());

        Self {
            backend_id: backend_id.to_string(),
            client,
            requests: AtomicU64::new(0),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub async fn send(&self, req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.client.request(req).await
    }

    pub fn requests_served(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Backends with a live pooled client.
    pub total_connections: usize,
    pub total_requests: u64,
}

/// One reusable HTTP client per backend id, created on first use.
pub struct ConnectionPool {
    config: PoolConfig,
    clients: DashMap<String, Arc<PooledClient>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn get_connection(&self, backend_id: &str) -> Result<Arc<PooledClient>, ProxyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::PoolClosed);
        }

        // The entry guard holds the shard lock, so concurrent first access
        // for the same id builds exactly one client.
        let client = self
            .clients
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(backend = %backend_id, "Creating pooled client");
                Arc::new(PooledClient::new(backend_id, &self.config))
            })
            .clone();

        // Lost a race with close(): drop what we may have inserted.
        if self.closed.load(Ordering::Acquire) {
            self.clients.remove(backend_id);
            return Err(ProxyError::PoolClosed);
        }

        Ok(client)
    }

    /// Drop the client pooled for `backend_id`, if any.
    pub fn release(&self, backend_id: &str) -> bool {
        let released = self.clients.remove(backend_id).is_some();
        if released {
            tracing::debug!(backend = %backend_id, "Released pooled client");
        }
        released
    }

    pub fn stats(&self) -> PoolStats {
        let total_requests = self
            .clients
            .iter()
            .map(|entry| entry.value().requests_served())
            .sum();

        PoolStats {
            total_connections: self.clients.len(),
            total_requests,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release every client. Calling it again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let released = self.clients.len();
        self.clients.clear();
        tracing::info!(released, "Connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_id_returns_same_client() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let first = pool.get_connection("a").unwrap();
        let second = pool.get_connection("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.backend_id(), "a");
    }

    #[test]
    fn test_stats_count_distinct_ids() {
        let pool = ConnectionPool::new(PoolConfig::default());
        for id in ["a", "b", "a", "c", "b"] {
            pool.get_connection(id).unwrap();
        }
        assert_eq!(pool.stats().total_connections, 3);
        assert_eq!(pool.stats().total_requests, 0);
    }

    #[test]
    fn test_release_drops_single_entry() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let before = pool.get_connection("a").unwrap();
        pool.get_connection("b").unwrap();

        assert!(pool.release("a"));
        assert!(!pool.release("a"));
        assert_eq!(pool.stats().total_connections, 1);

        let after = pool.get_connection("a").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_close_is_idempotent_and_fails_fast() {
        let pool = ConnectionPool::new(PoolConfig::default());
        pool.get_connection("a").unwrap();

        pool.close();
        pool.close();

        assert!(pool.is_closed());
        assert_eq!(pool.stats().total_connections, 0);
        assert!(matches!(pool.get_connection("a"), Err(ProxyError::PoolClosed)));
        assert_eq!(pool.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_access_creates_one_client() {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.get_connection("shared").unwrap() }));
        }

        let clients: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(pool.stats().total_connections, 1);
    }
}

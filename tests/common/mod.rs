//! Shared utilities for forwarding tests.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use upstream_proxy::config::{BackendConfig, ProxyConfig};

/// A local backend whose reply depends on how many requests it has seen.
pub struct TestBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl TestBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start a backend; `script` maps the zero-based request index to a reply.
pub async fn start_programmable_backend<F>(script: F) -> TestBackend
where
    F: Fn(usize) -> (u16, &'static str) + Send + Sync + 'static,
{
    start_delayed_backend(Duration::ZERO, script).await
}

/// Like [`start_programmable_backend`] but every reply waits `delay` first.
pub async fn start_delayed_backend<F>(delay: Duration, script: F) -> TestBackend
where
    F: Fn(usize) -> (u16, &'static str) + Send + Sync + 'static,
{
    let hits = Arc::new(AtomicUsize::new(0));
    let script = Arc::new(script);

    let counter = hits.clone();
    let make_svc = make_service_fn(move |_| {
        let counter = counter.clone();
        let script = script.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |_req: hyper::Request<Body>| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = script(n);
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = StatusCode::from_u16(status).unwrap();
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestBackend { addr, hits }
}

pub fn backend_config(id: &str, url: &str) -> BackendConfig {
    BackendConfig {
        id: id.to_string(),
        url: url.to_string(),
        weight: 1,
        active: true,
        health_check_path: "/".to_string(),
    }
}

/// Health checks off and a short retry delay.
pub fn test_config(backends: Vec<BackendConfig>) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.backends = backends;
    config.health_check.enabled = false;
    config.retry.retry_delay_ms = 10;
    config
}

// src/proxy/cache.rs
use async_trait::async_trait;
use dashmap::DashMap;
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, SET_COOKIE};
use hyper::http::request::Parts;
use hyper::{Body, HeaderMap, Method, Response, StatusCode};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Key/value store the proxy uses for idempotent responses.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedResponse>;

    async fn set(&self, key: String, value: CachedResponse, ttl: Duration);
}

struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
}

/// In-process cache; expired entries are dropped lazily on lookup or by
/// `purge_expired`.
#[derive(Default)]
pub struct MemoryResponseCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn get(&self, key: &str) -> Option<CachedResponse> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.response.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.expires_at <= Instant::now());
        }
        None
    }

    async fn set(&self, key: String, value: CachedResponse, ttl: Duration) {
        let entry = CacheEntry {
            response: value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key, entry);
    }
}

fn cache_control_has(headers: &HeaderMap, directives: &[&str]) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directives.contains(&directive.as_str()))
}

/// Idempotent, bodiless and not opted out by the client.
pub fn is_cacheable_request(method: &Method, headers: &HeaderMap, body: &Bytes) -> bool {
    (*method == Method::GET || *method == Method::HEAD)
        && body.is_empty()
        && !cache_control_has(headers, &["no-store", "no-cache"])
}

pub fn is_cacheable_response(status: StatusCode, headers: &HeaderMap) -> bool {
    status.is_success()
        && !headers.contains_key(SET_COOKIE)
        && !cache_control_has(headers, &["no-store", "private"])
}

/// Method, full URI and the values of each vary header.
pub fn cache_key(parts: &Parts, vary_headers: &[String]) -> String {
    let mut key = format!("{} {}", parts.method, parts.uri);
    for name in vary_headers {
        let values: Vec<&str> = parts
            .headers
            .get_all(name.as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        key.push('\n');
        key.push_str(name);
        key.push('=');
        key.push_str(&values.join(","));
    }
    key
}

// src/proxy/forward.rs
// Rewrites inbound requests for an upstream and cleans upstream responses.

use super::backend::Backend;
use crate::error::ProxyError;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::http::request::Parts;
use hyper::{Body, HeaderMap, Request, Uri};
use std::net::SocketAddr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REQUEST_ID: &str = "x-request-id";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Backend base URL (scheme, authority and path prefix) followed by the
/// inbound path and query.
pub fn upstream_uri(backend: &Backend, inbound: &Uri) -> Result<Uri, ProxyError> {
    let base = backend.url.as_str().trim_end_matches('/');
    let path_and_query = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{}{}", base, path_and_query)
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidRequest(format!("cannot build upstream uri: {}", e)))
}

pub fn build_upstream_request(
    parts: &Parts,
    body: Bytes,
    backend: &Backend,
    client_addr: Option<SocketAddr>,
) -> Result<Request<Body>, ProxyError> {
    let uri = upstream_uri(backend, &parts.uri)?;

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);

    if let Some(authority) = uri.authority() {
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid host header: {}", e)))?;
        headers.insert(HOST, host);
    }

    if let Some(addr) = client_addr {
        let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, addr.ip()),
            None => addr.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }

    let mut request = Request::new(Body::from(body));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;
    Ok(request)
}

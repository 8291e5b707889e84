// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use crate::proxy::{ProxyManager, RequestContext};

#[derive(Clone)]
pub struct RequestHandler {
    manager: Arc<ProxyManager>,
    client_addr: Option<SocketAddr>,
}

impl RequestHandler {
    pub fn new(manager: Arc<ProxyManager>) -> Self {
        Self {
            manager,
            client_addr: None,
        }
    }

    /// Handler bound to one accepted connection.
    pub fn with_peer(&self, peer: SocketAddr) -> Self {
        Self {
            manager: self.manager.clone(),
            client_addr: Some(peer),
        }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let manager = self.manager.clone();
        let mut ctx = RequestContext::new().with_timeout(manager.config().timeouts.request_timeout());
        if let Some(addr) = self.client_addr {
            ctx = ctx.with_client_addr(addr);
        }

        Box::pin(async move {
            let method = req.method().clone();
            let uri = req.uri().clone();
            match manager.forward(&ctx, req).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    tracing::error!(%method, %uri, error = %e, "proxy error");
                    Ok(e.into())
                }
            }
        })
    }
}

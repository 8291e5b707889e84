// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::server::handler::RequestHandler;
use anyhow::{Context, Result};
use hyper::server::conn::Http;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Accept loop that hands every connection to a clone of the handler.
pub struct ServerBuilder {
    addr: SocketAddr,
    handler: Option<RequestHandler>,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, handler: None }
    }

    pub fn with_handler(mut self, handler: RequestHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Bind, then serve until `shutdown` resolves. In-flight connections
    /// keep running on their own tasks.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handler = self
            .handler
            .context("a request handler must be set with with_handler()")?;

        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        tracing::info!("HTTP server listening on {}", self.addr);

        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept connection");
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("HTTP server stopped accepting connections");
                    return Ok(());
                }
            };

            let svc = handler.with_peer(peer);
            tokio::spawn(async move {
                if let Err(err) = Http::new().serve_connection(stream, svc).await {
                    tracing::warn!(%peer, %err, "connection error");
                }
            });
        }
    }
}

//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router: one fallback handler for every method and target
//! - Wire up request tracing
//! - Bind to a listener and serve until shutdown
//!
//! # Design Decisions
//! - No routes: the proxy does not own any path, absolute-form targets included
//! - Connections are served by hyper's HTTP/1 builder with header case
//!   preservation; the case map rides in request extensions to the origin
//! - Each connection is read through a [`WireTap`]; the caller's header lines
//!   reach the dispatcher as a [`WireHeaders`] extension
//! - Graceful shutdown lets in-flight cycles finish streaming, bounded by
//!   [`SHUTDOWN_GRACE`]

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::Response,
    Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::dispatch::Dispatcher;
use crate::http::wire::{RequestHeads, WireHeaders, WireTap};

/// How long shutdown waits for open connections.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// HTTP front end of the capture proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    pub fn new(config: ProxyConfig, dispatcher: Dispatcher) -> Self {
        let router = Self::build_router(dispatcher);
        Self { router, config }
    }

    fn build_router(dispatcher: Dispatcher) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(dispatcher)
            .layer(TraceLayer::new_for_http())
    }

    /// The router, for driving requests without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Serve on `listener` until `shutdown` fires (or its sender is dropped).
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            rewrite_rules = self.config.rewrite.len(),
            "Capture proxy listening"
        );

        let graceful = GracefulShutdown::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let heads = RequestHeads::default();
                    let service = self.router.clone().map_request(tag_wire_headers(heads.clone()));
                    let connection = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .timer(TokioTimer::new())
                        .serve_connection(
                            TokioIo::new(WireTap::new(stream, heads)),
                            TowerToHyperService::new(service),
                        );
                    let connection = graceful.watch(connection);
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            tracing::debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                _ = shutdown.recv() => break,
            }
        }

        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => tracing::info!("HTTP server stopped"),
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                tracing::warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Connections still open after grace period")
            }
        }
        Ok(())
    }
}

/// Attach the next recorded head of the connection to each request.
fn tag_wire_headers(heads: RequestHeads) -> impl Fn(Request<Incoming>) -> Request<Incoming> + Clone {
    move |mut request| {
        if let Some(raw) = heads.pop() {
            request.extensions_mut().insert(WireHeaders(raw));
        }
        request
    }
}

async fn proxy_handler(State(dispatcher): State<Dispatcher>, request: Request<Body>) -> Response {
    dispatcher.dispatch(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::observer::LocalCollaborator;
    use crate::capture::store::testing::MemoryStore;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn server() -> HttpServer {
        let config = ProxyConfig::default();
        let dispatcher = Dispatcher::new(
            &config,
            Arc::new(MemoryStore::default()),
            Arc::new(LocalCollaborator::default()),
        )
        .unwrap();
        HttpServer::new(config, dispatcher)
    }

    #[tokio::test]
    async fn connect_is_rejected() {
        let request = Request::builder()
            .method("CONNECT")
            .uri("api.test:443")
            .body(Body::empty())
            .unwrap();
        let response = server().router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn target_without_host_is_rejected() {
        let request = Request::builder().uri("/no-host").body(Body::empty()).unwrap();
        let response = server().router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

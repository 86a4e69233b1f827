//! Request dispatcher: one inbound request in, one capture cycle out.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → allocate (requestID, cycleID)
//!     → note whether the caller accepts gzip
//!     → OutboundDescriptor (hop-by-hop stripped, Accept-Encoding forced to gzip)
//!     → rewrite engine (first matching rule)
//!     → file:  StaticFileServer
//!       other: Relay
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request};
use axum::response::{IntoResponse, Response};

use crate::capture::observer::Collaborator;
use crate::capture::recorder::CycleRecorder;
use crate::capture::store::ArtifactStore;
use crate::config::ProxyConfig;
use crate::dispatch::descriptor::OutboundDescriptor;
use crate::error::{ProxyError, ProxyResult};
use crate::observability::metrics;
use crate::relay::tee::InboundBody;
use crate::relay::Relay;
use crate::rewrite::RewriteEngine;
use crate::static_files::StaticFileServer;

/// Longest path prefix written to the per-cycle log line.
const LOGGED_PATH_CHARS: usize = 50;

/// Shared, cheaply clonable entry point for every inbound request.
#[derive(Clone)]
pub struct Dispatcher {
    rewrites: RewriteEngine,
    relay: Relay,
    files: StaticFileServer,
    store: Arc<dyn ArtifactStore>,
    collaborator: Arc<dyn Collaborator>,
}

impl Dispatcher {
    pub fn new(
        config: &ProxyConfig,
        store: Arc<dyn ArtifactStore>,
        collaborator: Arc<dyn Collaborator>,
    ) -> ProxyResult<Self> {
        Ok(Self {
            rewrites: RewriteEngine::new(config.rewrite.clone()),
            relay: Relay::new(Duration::from_secs(config.timeouts.idle_secs))?,
            files: StaticFileServer::new(config.cors.allow_headers.clone()),
            store,
            collaborator,
        })
    }

    pub fn rewrites(&self) -> &RewriteEngine {
        &self.rewrites
    }

    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        let start = Instant::now();

        if request.method() == Method::CONNECT {
            tracing::warn!(target_uri = %request.uri(), "CONNECT tunnels are not supported");
            metrics::record_cycle("rejected", start);
            return ProxyError::InvalidTarget("CONNECT tunnels are not supported".into()).into_response();
        }

        let ids = match self.collaborator.allocate_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Could not allocate cycle identifiers");
                metrics::record_cycle("rejected", start);
                return e.into_response();
            }
        };

        let (parts, body) = request.into_parts();
        let caller_accepts_gzip = accepts_gzip(&parts.headers);
        let inbound = InboundBody::new(body, &parts.headers);
        let origin = parts
            .headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let recorder = CycleRecorder::new(ids, self.store.clone(), self.collaborator.clone());

        let descriptor = match prepare(&parts) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(request_id = %recorder.request_id(), error = %e, "Rejected inbound request");
                recorder.fail(e.to_string());
                metrics::record_cycle("rejected", start);
                return e.into_response();
            }
        };
        let descriptor = self.rewrites.apply(descriptor);

        tracing::info!(
            request_id = %recorder.request_id(),
            cycle_id = %recorder.ids().cycle_id,
            method = %descriptor.method,
            protocol = %descriptor.protocol,
            hostname = %descriptor.hostname,
            path = %truncate(&descriptor.path(), LOGGED_PATH_CHARS),
            "Capturing request"
        );

        if descriptor.is_local_file() {
            let response = self.files.serve(descriptor, origin, recorder).await;
            let outcome = if response.status().is_success() { "served_file" } else { "file_missing" };
            metrics::record_cycle(outcome, start);
            return response;
        }

        let (response, outcome) = self.relay.forward(descriptor, inbound, caller_accepts_gzip, recorder).await;
        metrics::record_cycle(outcome.label(), start);
        response
    }
}

/// Outbound descriptor for the inbound head, before rewriting.
fn prepare(parts: &axum::http::request::Parts) -> ProxyResult<OutboundDescriptor> {
    let mut descriptor = OutboundDescriptor::from_request_parts(parts)?;
    descriptor.headers.strip_hop_by_hop();
    // outbound always asks for gzip; delivery follows the caller's own header
    descriptor.headers.set("Accept-Encoding", "gzip")?;
    Ok(descriptor)
}

/// Whether any `Accept-Encoding` value mentions gzip.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("gzip"))
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

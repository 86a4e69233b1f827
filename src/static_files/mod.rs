//! Local file responder for `file:` rewrite targets.
//!
//! # Data Flow
//! ```text
//! descriptor (protocol file:, pathname = filesystem path)
//!     → begin stage (hostname "[local file]", port 0)
//!     → metadata check
//!         ├─ regular file → respond(200, CORS) + finish(size, maybeJSON) → stream file
//!         └─ otherwise    → request-error "file not found" → 404 "File not found"
//! ```
//!
//! # Design Decisions
//! - No content negotiation, ranges, or encoding; bytes go out as stored
//! - `maybeJSON` is always true for served files
//! - Permissive CORS so browser tooling can fetch mocked responses

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use tokio_util::io::ReaderStream;

use crate::capture::artifacts::BeginArtifact;
use crate::capture::recorder::CycleRecorder;
use crate::dispatch::descriptor::{OutboundDescriptor, Protocol};
use crate::error::{ProxyError, ProxyResult};
use crate::http::headers::{HeaderSet, RestoredHeaders};

/// Hostname recorded for cycles served from disk.
pub const LOCAL_FILE_HOST: &str = "[local file]";

const ALLOW_METHODS: &str = "GET, POST, OPTIONS, PUT, DELETE";

/// Serves rewrite targets that point at the local filesystem.
#[derive(Debug, Clone)]
pub struct StaticFileServer {
    allow_headers: String,
}

impl StaticFileServer {
    pub fn new(allow_headers: impl Into<String>) -> Self {
        Self {
            allow_headers: allow_headers.into(),
        }
    }

    /// CORS headers for a served file; `origin` echoes the caller's `Origin`.
    pub fn cors_headers(&self, origin: Option<&str>) -> RestoredHeaders {
        HeaderSet::from_raw([
            ("Access-Control-Allow-Origin", origin.unwrap_or("*")),
            ("Access-Control-Allow-Methods", ALLOW_METHODS),
            ("Access-Control-Allow-Headers", self.allow_headers.as_str()),
            ("Access-Control-Allow-Credentials", "true"),
        ])
        .restore()
    }

    pub async fn serve(
        &self,
        mut descriptor: OutboundDescriptor,
        origin: Option<String>,
        mut recorder: CycleRecorder,
    ) -> Response {
        descriptor.protocol = Protocol::File;
        descriptor.hostname = LOCAL_FILE_HOST.to_string();
        descriptor.port = 0;

        let cycle_id = recorder.ids().cycle_id.clone();
        let artifact = BeginArtifact::from_descriptor(
            recorder.request_id(),
            &cycle_id,
            recorder.start_time(),
            &descriptor,
        );
        let begun = recorder.begin(artifact);

        let cors = self.cors_headers(origin.as_deref());
        let path = PathBuf::from(&descriptor.pathname);

        match open_regular_file(&path).await {
            Ok((file, size)) => {
                tracing::debug!(request_id = %recorder.request_id(), path = %path.display(), size, "Serving local file");
                let head = cors.to_header_map();
                recorder.respond(StatusCode::OK, cors);
                recorder.finish(size, true);

                let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
                *response.headers_mut() = head;
                response
            }
            Err(e) => {
                tracing::warn!(request_id = %recorder.request_id(), path = %path.display(), "Local file not found");
                // keep request-begin ahead of the error for observers
                let _ = begun.await;
                recorder.fail(e.to_string());

                let mut response = Response::new(Body::from("File not found"));
                *response.status_mut() = StatusCode::NOT_FOUND;
                *response.headers_mut() = cors.to_header_map();
                response
            }
        }
    }
}

/// Open `path` if it names a regular file; returns the handle and its size.
async fn open_regular_file(path: &Path) -> ProxyResult<(tokio::fs::File, u64)> {
    let not_found = || ProxyError::NotFound(path.to_path_buf());
    let metadata = tokio::fs::metadata(path).await.map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }
    let file = tokio::fs::File::open(path).await.map_err(|_| not_found())?;
    Ok((file, metadata.len()))
}

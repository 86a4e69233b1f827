//! Crate-wide error type.
//!
//! # Design Decisions
//! - One enum for every failure a cycle can end on; all are terminal
//! - Callers only ever see standard HTTP responses rendered from it
//! - Rewrite and config errors live next to their modules and never reach here

use std::path::PathBuf;
use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors that terminate a capture cycle.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The origin produced nothing for longer than the idle timeout.
    #[error("origin idle for more than {}s", .0.as_secs())]
    Timeout(Duration),

    /// Connect failure, reset, or any other transport error on the origin side.
    #[error("{0}")]
    Upstream(String),

    /// The caller's request body stream failed mid-transfer.
    #[error("inbound request aborted: {0}")]
    InboundAborted(String),

    /// The caller stopped reading the response.
    #[error("client closed the connection")]
    ClientGone,

    /// Static target missing or not a plain file.
    #[error("file not found")]
    NotFound(PathBuf),

    /// The request target could not be turned into an outbound descriptor.
    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The identifier collaborator could not hand out an ID pair.
    #[error("identifier allocation failed: {0}")]
    IdAllocation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// JSON body returned to the caller when the origin fails before headers are sent.
#[derive(Debug, Serialize)]
struct GatewayFailure<'a> {
    error: &'static str,
    code: u16,
    message: &'a str,
}

impl ProxyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout(_))
    }

    /// Status code the caller sees for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Timeout(_) | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidTarget(_) | ProxyError::InvalidHeader(_) => StatusCode::BAD_REQUEST,
            ProxyError::InboundAborted(_) | ProxyError::ClientGone => StatusCode::BAD_REQUEST,
            ProxyError::IdAllocation(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the gateway-failure response: 502 with a pretty-printed JSON body.
    pub fn gateway_response(&self) -> Response {
        let message = self.to_string();
        let body = serde_json::to_string_pretty(&GatewayFailure {
            error: "target server failed",
            code: StatusCode::BAD_GATEWAY.as_u16(),
            message: &message,
        })
        .unwrap_or_default();

        let mut response = (StatusCode::BAD_GATEWAY, body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self.status() {
            StatusCode::BAD_GATEWAY => self.gateway_response(),
            status => (status, self.to_string()).into_response(),
        }
    }
}

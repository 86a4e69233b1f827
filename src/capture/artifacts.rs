//! Capture artifact shapes and file naming.
//!
//! Field names are consumed verbatim by the observer, hence the explicit
//! renames (`requestID`, `maybeJSON`, ...).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::dispatch::descriptor::{OutboundDescriptor, Protocol};
use crate::http::headers::RestoredHeaders;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Files written per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    RequestMeta,
    RequestBody,
    ResponseMeta,
    ResponseBody,
    FinishMeta,
}

impl ArtifactKind {
    pub fn file_name(&self, cycle_id: &str) -> String {
        match self {
            ArtifactKind::RequestMeta => format!("req-{cycle_id}.json"),
            ArtifactKind::RequestBody => format!("req-{cycle_id}.dat"),
            ArtifactKind::ResponseMeta => format!("res-{cycle_id}.json"),
            ArtifactKind::ResponseBody => format!("res-{cycle_id}.dat"),
            ArtifactKind::FinishMeta => format!("fin-{cycle_id}.json"),
        }
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::RequestMeta => "begin",
            ArtifactKind::RequestBody => "request_body",
            ArtifactKind::ResponseMeta => "respond",
            ArtifactKind::ResponseBody => "response_body",
            ArtifactKind::FinishMeta => "finish",
        }
    }
}

/// Payload of the `request-begin` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginSummary {
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "cycleID")]
    pub cycle_id: String,
    pub start_time: u64,
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub method: String,
    pub pathname: String,
}

/// `req-*.json`: the begin summary plus the outbound query and headers.
#[derive(Debug, Clone, Serialize)]
pub struct BeginArtifact {
    #[serde(flatten)]
    pub summary: BeginSummary,
    pub search: Option<String>,
    pub headers: RestoredHeaders,
}

impl BeginArtifact {
    pub fn from_descriptor(
        request_id: &str,
        cycle_id: &str,
        start_time: u64,
        descriptor: &OutboundDescriptor,
    ) -> Self {
        Self {
            summary: BeginSummary {
                request_id: request_id.to_string(),
                cycle_id: cycle_id.to_string(),
                start_time,
                protocol: descriptor.protocol,
                hostname: descriptor.hostname.clone(),
                port: descriptor.port,
                method: descriptor.method.to_string(),
                pathname: descriptor.pathname.clone(),
            },
            search: descriptor.query.as_ref().map(|q| format!("?{q}")),
            headers: descriptor.headers.restore(),
        }
    }
}

/// `res-*.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondArtifact {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub status_code: u16,
    pub headers: RestoredHeaders,
    pub response_time: u64,
    pub response_elapse: u64,
}

/// Payload of the `request-finish` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishSummary {
    pub size: u64,
    #[serde(rename = "maybeJSON")]
    pub maybe_json: bool,
    pub finish_elapse: u64,
}

/// `fin-*.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishArtifact {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub size: u64,
    #[serde(rename = "maybeJSON")]
    pub maybe_json: bool,
    pub finish_time: u64,
    pub finish_elapse: u64,
}

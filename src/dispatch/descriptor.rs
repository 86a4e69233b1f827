//! Outbound request descriptor.
//!
//! Built once from the inbound request, then handed by value through the
//! rewrite engine. Nothing else mutates it.

use std::fmt;
use std::str::FromStr;

use axum::http::{header, request, Extensions, Method};
use serde::Serialize;
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::http::headers::HeaderSet;
use crate::http::wire::WireHeaders;

/// Target protocol, rendered with a trailing colon ("http:") in artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    #[serde(rename = "http:")]
    Http,
    #[serde(rename = "https:")]
    Https,
    /// Target resolves to the local filesystem.
    #[serde(rename = "file:")]
    File,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http:",
            Protocol::Https => "https:",
            Protocol::File => "file:",
        }
    }

    pub fn scheme(&self) -> &'static str {
        self.as_str().trim_end_matches(':')
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
            Protocol::File => 0,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    /// Accepts "http", "http:", "HTTPS:" and so on.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_end_matches(':').to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "file" => Ok(Protocol::File),
            _ => Err(s.to_string()),
        }
    }
}

/// Everything needed to issue (or serve) the outbound side of a cycle.
#[derive(Debug, Clone)]
pub struct OutboundDescriptor {
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub method: Method,
    pub pathname: String,
    /// Query string without the leading `?`.
    pub query: Option<String>,
    pub headers: HeaderSet,
    /// Transport extensions of the inbound head. Carries the caller's header
    /// spelling through to the outbound request.
    pub extensions: Extensions,
}

impl OutboundDescriptor {
    /// Derive the descriptor from the inbound request head.
    ///
    /// Absolute-form targets are used as-is; origin-form targets fall back to
    /// the `Host` header over plain HTTP. Ports default per protocol.
    pub fn from_request_parts(parts: &request::Parts) -> ProxyResult<Self> {
        let target = if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
            parts.uri.to_string()
        } else {
            let host = parts
                .headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| ProxyError::InvalidTarget(parts.uri.to_string()))?;
            let path = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            format!("http://{host}{path}")
        };

        let url = Url::parse(&target)
            .map_err(|e| ProxyError::InvalidTarget(format!("{target}: {e}")))?;
        let protocol: Protocol = url
            .scheme()
            .parse()
            .map_err(|s| ProxyError::InvalidTarget(format!("unsupported protocol {s}")))?;
        if protocol == Protocol::File {
            return Err(ProxyError::InvalidTarget(target));
        }
        let hostname = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidTarget(target.clone()))?
            .to_string();

        Ok(Self {
            protocol,
            hostname,
            port: url.port().unwrap_or_else(|| protocol.default_port()),
            method: parts.method.clone(),
            pathname: url.path().to_string(),
            query: url.query().map(str::to_string),
            headers: inbound_headers(parts),
            extensions: parts.extensions.clone(),
        })
    }

    /// Path plus query, as sent on the request line.
    pub fn path(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.pathname, q),
            None => self.pathname.clone(),
        }
    }

    /// `host:port` as it belongs in a `Host` header.
    pub fn authority(&self) -> String {
        if self.port == self.protocol.default_port() {
            self.hostname.clone()
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    pub fn href(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol.scheme(),
            self.hostname,
            self.port,
            self.path()
        )
    }

    pub fn is_local_file(&self) -> bool {
        self.protocol == Protocol::File
    }
}

/// Caller headers in wire spelling when the connection recorded them.
///
/// A recorded head that disagrees with hyper's parse is ignored.
fn inbound_headers(parts: &request::Parts) -> HeaderSet {
    match parts.extensions.get::<WireHeaders>() {
        Some(WireHeaders(raw)) if raw.len() == parts.headers.len() => {
            HeaderSet::from_wire(&parts.headers, raw.clone())
        }
        _ => HeaderSet::from_header_map(&parts.headers),
    }
}

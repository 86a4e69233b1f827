//! Origin connections.
//!
//! One HTTP/1.1 connection per cycle, plain or TLS, opened within the idle
//! timeout. Header spelling survives in both directions:
//! - hyper writes the caller's casing onto the outbound request (the inbound
//!   head's case map travels in the request extensions)
//! - a [`WireTap`] records the origin's response head as it crosses the
//!   socket, so the raw header sequence can be rebuilt for capture
//!
//! Connections are never pooled; a recorded head always belongs to the cycle
//! that opened the connection.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::dispatch::descriptor::{OutboundDescriptor, Protocol};
use crate::error::{ProxyError, ProxyResult};
use crate::http::wire::{ResponseHead, WireTap};
use crate::relay::error_chain;

/// Opens origin connections for the relay.
#[derive(Clone)]
pub struct OriginConnector {
    tls: TlsConnector,
    idle_timeout: Duration,
}

/// A ready HTTP/1.1 connection plus the recorder of its response head.
pub struct OriginConnection {
    pub sender: SendRequest<Body>,
    pub head: ResponseHead,
}

impl OriginConnector {
    pub fn new(idle_timeout: Duration) -> ProxyResult<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Upstream(format!("TLS setup failed: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            idle_timeout,
        })
    }

    /// Connect (and for `https:` handshake) within one idle window each.
    pub async fn connect(&self, descriptor: &OutboundDescriptor) -> ProxyResult<OriginConnection> {
        let host = descriptor.hostname.trim_start_matches('[').trim_end_matches(']');
        let port = descriptor.port;

        let tcp = match tokio::time::timeout(self.idle_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return Err(ProxyError::Upstream(format!("connect {host}:{port}: {e}"))),
            Err(_) => return Err(ProxyError::Timeout(self.idle_timeout)),
        };
        let _ = tcp.set_nodelay(true);

        if descriptor.protocol != Protocol::Https {
            return handshake(tcp).await;
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::InvalidTarget(format!("{host}: {e}")))?;
        match tokio::time::timeout(self.idle_timeout, self.tls.connect(server_name, tcp)).await {
            Ok(Ok(tls)) => handshake(tls).await,
            Ok(Err(e)) => Err(ProxyError::Upstream(format!("TLS handshake with {host}:{port}: {e}"))),
            Err(_) => Err(ProxyError::Timeout(self.idle_timeout)),
        }
    }
}

async fn handshake<S>(stream: S) -> ProxyResult<OriginConnection>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let head = ResponseHead::default();
    let tap = WireTap::new(stream, head.clone());

    let (sender, connection) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(tap))
        .await
        .map_err(|e| ProxyError::Upstream(error_chain(&e)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Origin connection closed with error");
        }
    });

    Ok(OriginConnection { sender, head })
}

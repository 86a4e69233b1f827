//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use capture_proxy::capture::store::BodySink;
use capture_proxy::capture::{ArtifactStore, CaptureEvent, FsArtifactStore, LocalCollaborator};
use capture_proxy::config::{PortValue, ProxyConfig, RewriteRuleConfig, RuleEndpointConfig};
use capture_proxy::{Dispatcher, HttpServer, Shutdown};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Host the tests address; rewritten to the mock origin.
pub const UPSTREAM_HOST: &str = "api.example.test";

/// Read one HTTP/1.1 request (head plus content-length or chunked body) from `socket`.
pub async fn read_request(socket: &mut TcpStream) -> io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut body = buf[head_end..].to_vec();

    if header_value(&head, "transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
        while !body.ends_with(b"0\r\n\r\n") {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        return Ok((head, dechunk(&body)));
    }

    let length = header_value(&head, "content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    while body.len() < length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok((head, body))
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Decode a complete chunked body (no trailers).
fn dechunk(mut raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(line_end) = raw.windows(2).position(|w| w == b"\r\n") {
        let size_text = String::from_utf8_lossy(&raw[..line_end]);
        let size = usize::from_str_radix(size_text.split(';').next().unwrap_or("").trim(), 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        out.extend_from_slice(&raw[start..start + size]);
        raw = &raw[start + size + 2..];
    }
    out
}

/// Send `request` verbatim to `addr` and return everything read until close.
pub async fn raw_exchange(addr: SocketAddr, request: &str) -> String {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut reply = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut reply)).await;
    String::from_utf8_lossy(&reply).into_owned()
}

/// Start a programmable origin on an ephemeral port.
///
/// `respond` receives the request head and body and returns the raw response bytes.
pub async fn start_origin<F, Fut>(respond: F) -> SocketAddr
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<u8>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let respond = respond.clone();
            tokio::spawn(async move {
                let Ok((head, body)) = read_request(&mut socket).await else {
                    return;
                };
                let response = respond(head, body).await;
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Origin that always returns the same response.
pub async fn start_fixed_origin(response: Vec<u8>) -> SocketAddr {
    start_origin(move |_, _| {
        let response = response.clone();
        async move { response }
    })
    .await
}

/// Origin that accepts connections and never answers.
pub async fn start_silent_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Raw response with the given head lines and body.
pub fn http_response(status: &str, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("Connection: close\r\n\r\n");
    let mut out = out.into_bytes();
    out.extend_from_slice(body);
    out
}

fn endpoint(protocol: &str, domain: &str, port: Option<u16>) -> RuleEndpointConfig {
    RuleEndpointConfig {
        protocol: Some(protocol.into()),
        domain: Some(domain.into()),
        port: port.map(|p| PortValue::Number(p.into())),
        ..Default::default()
    }
}

/// Rule sending every request for [`UPSTREAM_HOST`] to `origin`.
pub fn rewrite_to(origin: SocketAddr) -> RewriteRuleConfig {
    RewriteRuleConfig {
        from: endpoint("http:", UPSTREAM_HOST, None),
        to: endpoint("http:", &origin.ip().to_string(), Some(origin.port())),
    }
}

/// Rule serving `path` on [`UPSTREAM_HOST`] from a local file.
pub fn rewrite_to_file(path: &str, file: &std::path::Path) -> RewriteRuleConfig {
    RewriteRuleConfig {
        from: RuleEndpointConfig {
            path: Some(path.into()),
            exact: true,
            ..endpoint("http:", UPSTREAM_HOST, None)
        },
        to: RuleEndpointConfig {
            protocol: Some("file:".into()),
            path: Some(file.display().to_string()),
            exact: true,
            ..Default::default()
        },
    }
}

/// Store that fails every write.
pub struct FailingStore;

impl ArtifactStore for FailingStore {
    fn write_json(&self, _name: String, _contents: Vec<u8>) -> BoxFuture<'static, io::Result<()>> {
        futures_util::future::ready(Err(io::Error::other("read-only filesystem"))).boxed()
    }

    fn create_body(&self, _name: String) -> BoxFuture<'static, io::Result<BodySink>> {
        futures_util::future::ready(Err(io::Error::other("read-only filesystem"))).boxed()
    }
}

/// A running proxy plus handles for inspecting what it captured.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub events: broadcast::Receiver<CaptureEvent>,
    pub capture_dir: PathBuf,
    shutdown: Shutdown,
}

impl TestProxy {
    /// Client that sends every request through the proxy.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::http(format!("http://{}", self.addr)).unwrap())
            .pool_max_idle_per_host(0)
            .build()
            .unwrap()
    }

    pub async fn artifact(&self, name: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.capture_dir.join(name)).await.ok()
    }

    pub async fn artifact_json(&self, name: &str) -> Option<serde_json::Value> {
        let bytes = self.artifact(name).await?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Collect events until `done` holds or `limit` passes.
    pub async fn events_until(
        &mut self,
        limit: Duration,
        done: impl Fn(&[CaptureEvent]) -> bool,
    ) -> Vec<CaptureEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + limit;
        while !done(&seen) {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Ok(event)) => seen.push(event),
                _ => break,
            }
        }
        seen
    }

    /// Wait for the finish event and return all events seen so far.
    pub async fn until_finished(&mut self) -> Vec<CaptureEvent> {
        self.events_until(Duration::from_secs(5), |events| {
            events.iter().any(|e| matches!(e, CaptureEvent::Finish { .. }))
        })
        .await
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
        let _ = std::fs::remove_dir_all(&self.capture_dir);
    }
}

/// Cycle ID announced in the first begin event.
pub fn cycle_id(events: &[CaptureEvent]) -> String {
    events
        .iter()
        .find_map(|e| match e {
            CaptureEvent::Begin(summary) => Some(summary.cycle_id.clone()),
            _ => None,
        })
        .expect("no request-begin event")
}

pub fn event_names(events: &[CaptureEvent]) -> Vec<&'static str> {
    events.iter().map(CaptureEvent::name).collect()
}

/// Start a proxy on an ephemeral port. `store` defaults to a fresh temp directory.
pub async fn start_proxy(config: ProxyConfig, store: Option<Arc<dyn ArtifactStore>>) -> TestProxy {
    let capture_dir = std::env::temp_dir().join(format!("capture-proxy-test-{}", uuid::Uuid::new_v4()));
    let store = match store {
        Some(store) => store,
        None => Arc::new(FsArtifactStore::open(&capture_dir).await.unwrap()),
    };

    let collaborator = LocalCollaborator::default();
    let events = collaborator.subscribe();
    let dispatcher = Dispatcher::new(&config, store, Arc::new(collaborator)).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let server = HttpServer::new(config, dispatcher);
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    TestProxy {
        addr,
        events,
        capture_dir,
        shutdown,
    }
}

/// Default config with one rewrite rule to `origin`.
pub fn config_for(origin: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.rewrite.push(rewrite_to(origin));
    config
}

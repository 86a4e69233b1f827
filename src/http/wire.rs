//! Header spelling as it crossed the socket.
//!
//! hyper keeps header case for re-serialization but does not expose it, so
//! heads are read a second time from the raw bytes. [`WireTap`] shows every
//! byte read from a connection to a [`WireObserver`]; the observers parse
//! heads with httparse and keep names exactly as sent.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Heads longer than this are not recorded.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

pub const MAX_HEADERS: usize = 128;

/// Header names and values in wire order.
pub type RawHeaders = Vec<(String, String)>;

/// Request extension holding the caller's header lines as sent.
#[derive(Debug, Clone)]
pub struct WireHeaders(pub RawHeaders);

/// Receives the bytes a [`WireTap`] reads.
pub trait WireObserver {
    fn observe(&self, bytes: &[u8]);
}

/// Passes bytes through untouched, showing what it reads to an observer.
pub struct WireTap<S, O> {
    inner: S,
    observer: O,
}

impl<S, O> WireTap<S, O> {
    pub fn new(inner: S, observer: O) -> Self {
        Self { inner, observer }
    }
}

impl<S: AsyncRead + Unpin, O: WireObserver + Unpin> AsyncRead for WireTap<S, O> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &polled {
            let fresh = &buf.filled()[before..];
            if !fresh.is_empty() {
                this.observer.observe(fresh);
            }
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin, O: Unpin> AsyncWrite for WireTap<S, O> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn collect(headers: &[httparse::Header<'_>]) -> RawHeaders {
    headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect()
}

/// Request heads read from one inbound connection, oldest first.
///
/// hyper dispatches requests of a connection in order, so the service pops
/// one head per request. Body bytes are skipped by their framing; anything
/// unparseable (or an upgrade) stops recording for the connection.
#[derive(Clone, Default)]
pub struct RequestHeads(Arc<Mutex<RequestScan>>);

#[derive(Default)]
struct RequestScan {
    pending: Vec<u8>,
    state: Framing,
    heads: VecDeque<RawHeaders>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Framing {
    #[default]
    Head,
    Fixed(u64),
    ChunkSize,
    ChunkData(u64),
    Trailers,
    Stopped,
}

impl RequestHeads {
    /// The next request's header lines, if they were recorded.
    pub fn pop(&self) -> Option<RawHeaders> {
        self.0.lock().ok()?.heads.pop_front()
    }
}

impl WireObserver for RequestHeads {
    fn observe(&self, bytes: &[u8]) {
        let Ok(mut scan) = self.0.lock() else {
            return;
        };
        if scan.state == Framing::Stopped {
            return;
        }
        scan.pending.extend_from_slice(bytes);
        scan.advance();
    }
}

impl RequestScan {
    fn advance(&mut self) {
        loop {
            let consumed = match self.state {
                Framing::Stopped => {
                    self.pending = Vec::new();
                    return;
                }
                Framing::Head => match self.parse_head() {
                    Some(len) => len,
                    None => return,
                },
                Framing::Fixed(left) | Framing::ChunkData(left) => {
                    if self.pending.is_empty() {
                        return;
                    }
                    let take = left.min(self.pending.len() as u64);
                    self.state = match (self.state, left - take) {
                        (Framing::Fixed(_), 0) => Framing::Head,
                        (Framing::Fixed(_), rest) => Framing::Fixed(rest),
                        (_, 0) => Framing::ChunkSize,
                        (_, rest) => Framing::ChunkData(rest),
                    };
                    take as usize
                }
                Framing::ChunkSize => match httparse::parse_chunk_size(&self.pending) {
                    Ok(httparse::Status::Complete((len, 0))) => {
                        self.state = Framing::Trailers;
                        len
                    }
                    Ok(httparse::Status::Complete((len, size))) => {
                        // data plus its trailing CRLF
                        self.state = Framing::ChunkData(size.saturating_add(2));
                        len
                    }
                    Ok(httparse::Status::Partial) => return,
                    Err(_) => {
                        self.state = Framing::Stopped;
                        continue;
                    }
                },
                Framing::Trailers => match self.pending.windows(2).position(|w| w == b"\r\n") {
                    Some(0) => {
                        self.state = Framing::Head;
                        2
                    }
                    Some(end) => end + 2,
                    None => return,
                },
            };
            self.pending.drain(..consumed);
        }
    }

    /// Parse one request head; returns the bytes it spans.
    fn parse_head(&mut self) -> Option<usize> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut slots);
        match request.parse(&self.pending) {
            Ok(httparse::Status::Complete(len)) => {
                let headers = collect(request.headers);
                let connect = request.method == Some("CONNECT");
                self.state = if connect { Framing::Stopped } else { body_framing(&headers) };
                self.heads.push_back(headers);
                Some(len)
            }
            Ok(httparse::Status::Partial) if self.pending.len() <= MAX_HEAD_BYTES => None,
            _ => {
                self.state = Framing::Stopped;
                self.pending = Vec::new();
                None
            }
        }
    }
}

fn body_framing(headers: &[(String, String)]) -> Framing {
    let value = |name: &str| {
        headers
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
    };
    if value("upgrade").is_some() {
        return Framing::Stopped;
    }
    if let Some(encoding) = value("transfer-encoding") {
        let chunked = encoding
            .rsplit(',')
            .next()
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        return if chunked { Framing::ChunkSize } else { Framing::Stopped };
    }
    match value("content-length").map(str::parse::<u64>) {
        None | Some(Ok(0)) => Framing::Head,
        Some(Ok(len)) => Framing::Fixed(len),
        Some(Err(_)) => Framing::Stopped,
    }
}

/// The final (non-1xx) response head read from an origin connection.
#[derive(Clone, Default)]
pub struct ResponseHead(Arc<Mutex<ResponseScan>>);

#[derive(Default)]
struct ResponseScan {
    pending: Vec<u8>,
    headers: Option<RawHeaders>,
    abandoned: bool,
}

enum Scan {
    Interim(usize),
    Final(RawHeaders),
    Partial,
    Invalid,
}

impl ResponseHead {
    /// Header lines of the final head, once it has been read.
    pub fn raw_headers(&self) -> Option<RawHeaders> {
        self.0.lock().ok().and_then(|state| state.headers.clone())
    }
}

impl WireObserver for ResponseHead {
    fn observe(&self, bytes: &[u8]) {
        let Ok(mut state) = self.0.lock() else {
            return;
        };
        if state.headers.is_some() || state.abandoned {
            return;
        }
        state.pending.extend_from_slice(bytes);
        state.scan();
    }
}

impl ResponseScan {
    fn scan(&mut self) {
        loop {
            match parse_response_head(&self.pending) {
                Scan::Interim(len) => {
                    self.pending.drain(..len);
                }
                Scan::Final(headers) => {
                    self.headers = Some(headers);
                    self.pending = Vec::new();
                    return;
                }
                Scan::Partial if self.pending.len() <= MAX_HEAD_BYTES => return,
                Scan::Partial | Scan::Invalid => {
                    self.abandoned = true;
                    self.pending = Vec::new();
                    return;
                }
            }
        }
    }
}

fn parse_response_head(bytes: &[u8]) -> Scan {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    match response.parse(bytes) {
        Ok(httparse::Status::Complete(len)) => {
            // 101 ends the exchange; other 1xx heads precede the real one
            if response.code.is_some_and(|code| (100..200).contains(&code) && code != 101) {
                return Scan::Interim(len);
            }
            Scan::Final(collect(response.headers))
        }
        Ok(httparse::Status::Partial) => Scan::Partial,
        Err(_) => Scan::Invalid,
    }
}

//! Request body tee.
//!
//! Streams the caller's upload to the origin and to `req-*.dat` at the same
//! time. Each chunk read from the caller and each hand-off to the origin gets
//! its own idle window, so a slow but active upload never times out.
//!
//! # Endings
//! ```text
//! caller body ends      → Complete (the relay starts timing the response head)
//! idle window exceeded  → Stalled  (outbound body errors, relay answers 502)
//! caller stream fails   → Aborted  (request-error, outbound body errors)
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::capture::recorder::FailureHandle;
use crate::capture::store::{ArtifactStore, BodyCapture};
use crate::error::ProxyError;
use crate::relay::{channel_stream, UPLOAD_BUFFER};

/// Whether the request head announces a body (content-length > 0 or a transfer-encoding).
pub fn has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .is_some_and(|len| len > 0)
}

/// The caller's request body, plus whether its head announced one.
///
/// Framing has to be read before hop-by-hop headers are stripped.
pub struct InboundBody {
    body: Body,
    framed: bool,
}

impl InboundBody {
    pub fn new(body: Body, headers: &HeaderMap) -> Self {
        Self {
            body,
            framed: has_body(headers),
        }
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            body: Body::empty(),
            framed: false,
        }
    }
}

/// How the caller's upload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Complete,
    Stalled,
    Aborted,
}

/// Outbound side of a running tee.
pub struct Upload {
    /// `None` when the request carries no body.
    pub body: Option<Body>,
    done: oneshot::Receiver<UploadOutcome>,
    settled: Option<UploadOutcome>,
}

impl Upload {
    /// Wait until the caller's body has been read to its end, stalled or failed.
    ///
    /// Cancel safe; may be called again after completing.
    pub async fn finished(&mut self) -> UploadOutcome {
        if let Some(outcome) = self.settled {
            return outcome;
        }
        // a vanished tee task never completed the upload
        let outcome = (&mut self.done).await.unwrap_or(UploadOutcome::Aborted);
        self.settled = Some(outcome);
        outcome
    }

    /// The outcome, if the upload already ended.
    pub fn settled(&mut self) -> Option<UploadOutcome> {
        if self.settled.is_none() {
            self.settled = self.done.try_recv().ok();
        }
        self.settled
    }
}

/// Start copying the inbound body to the artifact store and to the outbound
/// body of the returned [`Upload`].
///
/// The artifact is written even when the request carries no body.
pub fn spawn_request_tee(
    inbound: InboundBody,
    store: Arc<dyn ArtifactStore>,
    artifact: String,
    failure: FailureHandle,
    idle_timeout: Duration,
) -> Upload {
    let InboundBody { body, framed } = inbound;
    let (tx, rx) = mpsc::channel::<Result<Bytes, ProxyError>>(UPLOAD_BUFFER);
    let (done_tx, done) = oneshot::channel();

    tokio::spawn(async move {
        let mut capture = BodyCapture::open(store.as_ref(), artifact, "request_body").await;
        let mut inbound = body.into_data_stream();
        let mut forwarding = framed;

        let outcome = loop {
            let next = match tokio::time::timeout(idle_timeout, inbound.next()).await {
                Ok(next) => next,
                Err(_) => break UploadOutcome::Stalled,
            };
            match next {
                None => break UploadOutcome::Complete,
                Some(Ok(chunk)) => {
                    capture.write(&chunk).await;
                    if !forwarding {
                        continue;
                    }
                    match tokio::time::timeout(idle_timeout, tx.send(Ok(chunk))).await {
                        Ok(Ok(())) => {}
                        // origin side gone: keep draining into the artifact only
                        Ok(Err(_)) => forwarding = false,
                        Err(_) => break UploadOutcome::Stalled,
                    }
                }
                Some(Err(e)) => {
                    failure.fail(ProxyError::InboundAborted(e.to_string()).to_string());
                    break UploadOutcome::Aborted;
                }
            }
        };

        // the outcome goes out before the outbound body errors
        let _ = done_tx.send(outcome);
        match outcome {
            UploadOutcome::Complete => {}
            UploadOutcome::Stalled => {
                let _ = tx.try_send(Err(ProxyError::Timeout(idle_timeout)));
            }
            UploadOutcome::Aborted => {
                let _ = tx.try_send(Err(ProxyError::InboundAborted("request body aborted".into())));
            }
        }
        drop(tx);
        capture.finish().await;
    });

    Upload {
        body: framed.then(|| Body::from_stream(channel_stream(rx))),
        done,
        settled: None,
    }
}

//! Outbound forwarding to the origin.
//!
//! # Responsibilities
//! - Issue the outbound request described by an [`OutboundDescriptor`]
//! - Stream the caller's body through the request tee
//! - Turn origin status + headers into the caller's response head
//! - Hand the body to a [`ResponsePump`] task
//!
//! # Design Decisions
//! - Redirects are relayed, never followed; no outbound proxy is consulted
//! - A failure before headers reach the caller becomes a 502 JSON body;
//!   after that the caller's connection is dropped instead
//! - The response-head window starts once the upload is complete
//! - Dropping the forwarding future before headers (caller hung up) still
//!   announces the cycle's error

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::body::Incoming;
use tokio::sync::mpsc;

use crate::capture::artifacts::{ArtifactKind, BeginArtifact};
use crate::capture::recorder::{CycleRecorder, FailureHandle};
use crate::dispatch::descriptor::OutboundDescriptor;
use crate::error::{ProxyError, ProxyResult};
use crate::http::headers::HeaderSet;
use crate::http::wire::ResponseHead;
use crate::relay::origin::{OriginConnection, OriginConnector};
use crate::relay::pump::ResponsePump;
use crate::relay::tee::{spawn_request_tee, InboundBody, Upload, UploadOutcome};
use crate::relay::transcode::{TranscodePlan, Transcoder};
use crate::relay::{channel_stream, error_chain, DELIVERY_BUFFER};

/// How a forwarded cycle ended from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The origin's status and headers went to the caller.
    Relayed,
    /// The origin failed first; the caller got a 502 JSON body.
    GatewayError,
    /// The cycle had already failed on the caller's side.
    Abandoned,
}

impl RelayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Relayed => "relayed",
            RelayOutcome::GatewayError => "gateway_error",
            RelayOutcome::Abandoned => "abandoned",
        }
    }
}

/// Forwards capture cycles to their origin servers.
#[derive(Clone)]
pub struct Relay {
    connector: OriginConnector,
    idle_timeout: Duration,
}

impl Relay {
    pub fn new(idle_timeout: Duration) -> ProxyResult<Self> {
        Ok(Self {
            connector: OriginConnector::new(idle_timeout)?,
            idle_timeout,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Run one cycle against the origin and produce the caller's response.
    ///
    /// `descriptor` is final (rewrite applied, hop-by-hop headers gone,
    /// `Accept-Encoding: gzip` forced). The returned response streams; the
    /// finish stage is recorded by the pump once the body is done.
    pub async fn forward(
        &self,
        descriptor: OutboundDescriptor,
        inbound: InboundBody,
        caller_accepts_gzip: bool,
        mut recorder: CycleRecorder,
    ) -> (Response, RelayOutcome) {
        let failure = recorder.failure_handle();
        let guard = HangupGuard::new(failure.clone());
        let cycle_id = recorder.ids().cycle_id.clone();

        let artifact = BeginArtifact::from_descriptor(
            recorder.request_id(),
            &cycle_id,
            recorder.start_time(),
            &descriptor,
        );
        recorder.begin(artifact);

        let mut upload = spawn_request_tee(
            inbound,
            recorder.store(),
            ArtifactKind::RequestBody.file_name(&cycle_id),
            failure.clone(),
            self.idle_timeout,
        );

        let (response, wire_head) = match self.exchange(&descriptor, &mut upload).await {
            Ok(exchanged) => exchanged,
            Err(e) => {
                guard.disarm();
                return origin_failure(&failure, e);
            }
        };

        let (parts, origin_body) = response.into_parts();
        let status = parts.status;
        let mut headers = match wire_head.raw_headers() {
            Some(raw) => HeaderSet::from_wire(&parts.headers, raw),
            None => HeaderSet::from_header_map(&parts.headers),
        };
        headers.strip_hop_by_hop();

        let bodiless = descriptor.method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let plan = TranscodePlan::choose(&headers, caller_accepts_gzip, bodiless);
        if let Err(e) = plan.apply_headers(&mut headers) {
            guard.disarm();
            return origin_failure(&failure, e);
        }

        let restored = headers.restore();
        let head = restored.to_header_map();
        recorder.respond(status, restored);
        tracing::debug!(
            request_id = %recorder.request_id(),
            status = status.as_u16(),
            plan = ?plan,
            "Origin responded"
        );

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let pump = ResponsePump::new(
            recorder,
            Transcoder::new(plan),
            tx,
            self.idle_timeout,
            ArtifactKind::ResponseBody.file_name(&cycle_id),
        );
        tokio::spawn(pump.run(Body::new(origin_body).into_data_stream()));
        guard.disarm();

        let mut out = Response::new(Body::from_stream(channel_stream(rx)));
        *out.status_mut() = status;
        *out.headers_mut() = head;
        // carries the origin's header spelling back to the caller's connection
        *out.extensions_mut() = parts.extensions;
        (out, RelayOutcome::Relayed)
    }

    /// Connect, send, and wait for the response head.
    ///
    /// While the upload runs, the tee's per-chunk windows are the only timer;
    /// once it is complete the origin gets one idle window to answer.
    async fn exchange(
        &self,
        descriptor: &OutboundDescriptor,
        upload: &mut Upload,
    ) -> ProxyResult<(hyper::Response<Incoming>, ResponseHead)> {
        let OriginConnection { mut sender, head } = self.connector.connect(descriptor).await?;
        let request = outbound_request(descriptor, upload.body.take())?;

        let send = sender.send_request(request);
        tokio::pin!(send);

        let answered = tokio::select! {
            result = &mut send => Some(result),
            outcome = upload.finished() => match outcome {
                UploadOutcome::Complete => None,
                UploadOutcome::Stalled => return Err(ProxyError::Timeout(self.idle_timeout)),
                UploadOutcome::Aborted => {
                    return Err(ProxyError::InboundAborted("request body aborted".into()))
                }
            },
        };
        let result = match answered {
            Some(result) => result,
            None => tokio::time::timeout(self.idle_timeout, send)
                .await
                .map_err(|_| ProxyError::Timeout(self.idle_timeout))?,
        };

        match result {
            Ok(response) => Ok((response, head)),
            Err(_) if upload.settled() == Some(UploadOutcome::Stalled) => {
                Err(ProxyError::Timeout(self.idle_timeout))
            }
            Err(e) => Err(ProxyError::Upstream(error_chain(&e))),
        }
    }
}

/// Origin-form request for `descriptor`, with the caller's transport
/// extensions so hyper writes the caller's header spelling.
fn outbound_request(descriptor: &OutboundDescriptor, body: Option<Body>) -> ProxyResult<Request<Body>> {
    let mut headers: HeaderMap = descriptor.headers.restore().to_header_map();
    if !headers.contains_key(header::HOST) {
        let host = HeaderValue::from_str(&descriptor.authority())
            .map_err(|_| ProxyError::InvalidHeader(format!("Host: {}", descriptor.authority())))?;
        headers.insert(header::HOST, host);
    }

    let mut request = Request::builder()
        .method(descriptor.method.clone())
        .uri(descriptor.path())
        .body(body.unwrap_or_else(Body::empty))
        .map_err(|e| ProxyError::InvalidTarget(format!("{}: {e}", descriptor.href())))?;
    *request.headers_mut() = headers;
    *request.extensions_mut() = descriptor.extensions.clone();
    Ok(request)
}

/// Failure before any response byte reached the caller.
///
/// When the cycle already failed on the inbound side nobody is listening,
/// so only an empty status is produced.
fn origin_failure(failure: &FailureHandle, error: ProxyError) -> (Response, RelayOutcome) {
    if !failure.fail(error.to_string()) {
        return (StatusCode::BAD_REQUEST.into_response(), RelayOutcome::Abandoned);
    }
    (error.gateway_response(), RelayOutcome::GatewayError)
}

/// Fails the cycle if the forwarding future is dropped before the caller
/// received a response head.
struct HangupGuard {
    failure: Option<FailureHandle>,
}

impl HangupGuard {
    fn new(failure: FailureHandle) -> Self {
        Self { failure: Some(failure) }
    }

    fn disarm(mut self) {
        self.failure = None;
    }
}

impl Drop for HangupGuard {
    fn drop(&mut self) {
        if let Some(failure) = self.failure.take() {
            failure.fail(ProxyError::ClientGone.to_string());
        }
    }
}

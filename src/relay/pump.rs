//! Response body pump.
//!
//! Runs as its own task once the caller has its status line and headers.
//! Every origin read is bounded by the idle timeout; every transcoded chunk is
//! handed to the caller before the next read, and mirrored into `res-*.dat`.
//!
//! # Endings
//! ```text
//! origin end        → codec tail, close delivery, close res-*.dat, finish stage
//! origin error/idle → request-error, caller body errors out (connection dropped)
//! caller gone       → request-error, origin read abandoned
//! ```

use std::fmt::Display;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::capture::recorder::{CycleRecorder, CycleState, FailureHandle};
use crate::capture::store::BodyCapture;
use crate::error::ProxyError;
use crate::relay::sniff::JsonSniffer;
use crate::relay::transcode::{Forked, Transcoder};

/// Chunks handed to the caller's response body.
pub type Delivery = mpsc::Sender<io::Result<Bytes>>;

/// Moves one response body from the origin to the caller and the capture store.
pub struct ResponsePump {
    recorder: CycleRecorder,
    failure: FailureHandle,
    transcoder: Transcoder,
    delivery: Delivery,
    idle_timeout: Duration,
    artifact: String,
}

impl ResponsePump {
    pub fn new(
        recorder: CycleRecorder,
        transcoder: Transcoder,
        delivery: Delivery,
        idle_timeout: Duration,
        artifact: String,
    ) -> Self {
        let failure = recorder.failure_handle();
        Self {
            recorder,
            failure,
            transcoder,
            delivery,
            idle_timeout,
            artifact,
        }
    }

    /// Drive `origin` to completion. Returns true when the cycle finished cleanly.
    pub async fn run<S, E>(mut self, origin: S) -> bool
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display + Send,
    {
        tokio::pin!(origin);
        let store = self.recorder.store();
        let mut capture = BodyCapture::open(store.as_ref(), self.artifact.clone(), "response_body").await;
        let mut sniffer = JsonSniffer::new();

        loop {
            let next = match tokio::time::timeout(self.idle_timeout, origin.next()).await {
                Err(_) => Err(ProxyError::Timeout(self.idle_timeout)),
                Ok(None) => break,
                Ok(Some(Err(e))) => Err(ProxyError::Upstream(e.to_string())),
                Ok(Some(Ok(chunk))) => self.transcoder.push(chunk),
            };
            let forked = match next {
                Ok(forked) => forked,
                Err(e) => {
                    self.abort(e).await;
                    capture.finish().await;
                    return false;
                }
            };
            if !self.relay(forked, &mut capture, &mut sniffer).await {
                capture.finish().await;
                return false;
            }
        }

        match self.transcoder.finish() {
            Ok(tail) => {
                if !self.relay(tail, &mut capture, &mut sniffer).await {
                    capture.finish().await;
                    return false;
                }
            }
            Err(e) => {
                self.abort(e).await;
                capture.finish().await;
                return false;
            }
        }

        let Self {
            mut recorder,
            delivery,
            ..
        } = self;
        // caller sees end of body now; the finish stage only needs the artifact
        drop(delivery);

        if !capture.finish().await {
            tracing::warn!(request_id = %recorder.request_id(), "Response body artifact incomplete; finish not recorded");
            return false;
        }
        if recorder.state() == CycleState::Failed {
            return false;
        }
        recorder.finish(sniffer.size(), sniffer.verdict());
        true
    }

    /// Hand one forked chunk to both paths. False once the caller is gone.
    async fn relay(&mut self, forked: Forked, capture: &mut BodyCapture, sniffer: &mut JsonSniffer) -> bool {
        if !forked.capture.is_empty() {
            sniffer.observe(&forked.capture);
            capture.write(&forked.capture).await;
        }
        if !forked.delivery.is_empty() && self.delivery.send(Ok(forked.delivery)).await.is_err() {
            self.failure.fail(ProxyError::ClientGone.to_string());
            return false;
        }
        true
    }

    async fn abort(&mut self, error: ProxyError) {
        let message = error.to_string();
        self.failure.fail(message.clone());
        // the caller's body fails, which drops its connection mid-stream
        let _ = self.delivery.send(Err(io::Error::other(message))).await;
    }
}

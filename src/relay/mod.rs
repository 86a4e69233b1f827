//! Transcoding relay subsystem.
//!
//! # Data Flow
//! ```text
//! inbound body ─▶ tee.rs ─┬─▶ outbound request body
//!                         └─▶ req-*.dat
//!
//! origin.rs (connect, TLS, response head tap)
//!     → upstream.rs (status + headers, transcode plan, respond stage)
//!     → pump.rs:
//!         origin chunk → transcode.rs ─┬─▶ delivery channel → caller
//!                                      └─▶ sniff.rs + res-*.dat
//!     → finish stage once res-*.dat is closed
//! ```
//!
//! # Design Decisions
//! - Bounded channels between stages: a slow caller or slow disk throttles
//!   reads from the origin, nothing is buffered in full
//! - The 5s idle timeout is an inactivity timer: connect, TLS handshake, every
//!   upload chunk, the wait for the response head and every body read each get
//!   their own window
//! - No retries; every failure is terminal for its cycle

pub mod origin;
pub mod pump;
pub mod sniff;
pub mod tee;
pub mod transcode;
pub mod upstream;

use futures_util::Stream;
use tokio::sync::mpsc;

pub use transcode::{TranscodePlan, Transcoder};
pub use upstream::{Relay, RelayOutcome};

/// Chunks in flight between the origin reader and the caller.
pub(crate) const DELIVERY_BUFFER: usize = 16;

/// Chunks in flight between the caller's upload and the origin.
pub(crate) const UPLOAD_BUFFER: usize = 8;

/// Adapt a bounded receiver into a stream for body construction.
pub(crate) fn channel_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> impl Stream<Item = T> + Send {
    futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

/// Render an error with its source chain ("a: b: c").
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

//! Identifier allocation and lifecycle announcements.
//!
//! # Responsibilities
//! - Hand out `(requestID, cycleID)` pairs
//! - Publish `request-begin` / `request-respond` / `request-finish` /
//!   `request-error` events, fire-and-forget
//!
//! The proxy core only talks to the [`Collaborator`] trait. [`LocalCollaborator`]
//! is the in-process default: UUID identifiers and a broadcast event bus.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::capture::artifacts::{BeginSummary, FinishSummary};
use crate::error::ProxyResult;

/// Identifier pair owned by one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CycleIds {
    pub request_id: String,
    pub cycle_id: String,
}

/// Lifecycle event announced to the observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum CaptureEvent {
    #[serde(rename = "request-begin")]
    Begin(BeginSummary),

    #[serde(rename = "request-respond")]
    Respond {
        #[serde(rename = "requestID")]
        request_id: String,
    },

    #[serde(rename = "request-finish")]
    Finish {
        #[serde(rename = "requestID")]
        request_id: String,
        #[serde(flatten)]
        summary: FinishSummary,
    },

    #[serde(rename = "request-error")]
    Error {
        #[serde(rename = "requestID")]
        request_id: String,
        message: String,
    },
}

impl CaptureEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureEvent::Begin(_) => "request-begin",
            CaptureEvent::Respond { .. } => "request-respond",
            CaptureEvent::Finish { .. } => "request-finish",
            CaptureEvent::Error { .. } => "request-error",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            CaptureEvent::Begin(summary) => &summary.request_id,
            CaptureEvent::Respond { request_id }
            | CaptureEvent::Finish { request_id, .. }
            | CaptureEvent::Error { request_id, .. } => request_id,
        }
    }
}

/// The process that owns identifiers and the observer event bus.
pub trait Collaborator: Send + Sync + 'static {
    fn allocate_ids(&self) -> BoxFuture<'static, ProxyResult<CycleIds>>;

    /// Fire-and-forget; must not block.
    fn announce(&self, event: CaptureEvent);
}

/// In-process collaborator: UUID v4 identifiers, broadcast event bus.
#[derive(Debug, Clone)]
pub struct LocalCollaborator {
    events: broadcast::Sender<CaptureEvent>,
}

impl LocalCollaborator {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events }
    }

    /// Attach an observer. Events announced before subscribing are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }
}

impl Default for LocalCollaborator {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Collaborator for LocalCollaborator {
    fn allocate_ids(&self) -> BoxFuture<'static, ProxyResult<CycleIds>> {
        let ids = CycleIds {
            request_id: Uuid::new_v4().to_string(),
            cycle_id: Uuid::new_v4().simple().to_string(),
        };
        futures_util::future::ready(Ok(ids)).boxed()
    }

    fn announce(&self, event: CaptureEvent) {
        tracing::debug!(event = event.name(), request_id = %event.request_id(), "Announcing capture event");
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

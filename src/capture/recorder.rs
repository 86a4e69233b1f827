//! Per-cycle capture recorder.
//!
//! # State Transitions
//! ```text
//! Created ─begin()─▶ BeginPending ─begin announced─▶ RespondPending
//!     ─respond announced─▶ FinishPending ─finish announced─▶ Done
//!
//! any state ─fail()─▶ Failed
//! ```
//!
//! # Ordering
//! Each stage runs as its own task: write the stage's JSON artifact, then wait
//! for the previous stage's announcement gate, then announce and open the gate
//! for the next stage. Writes of different stages therefore overlap freely
//! while announcements stay strictly begin → respond → finish.
//!
//! A stage whose artifact write fails is skipped, and so is every stage after
//! it. That telemetry is lost; delivery to the caller is unaffected. Once the
//! cycle has failed, stages still write their artifacts but announce nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::capture::artifacts::{
    now_millis, ArtifactKind, BeginArtifact, FinishArtifact, FinishSummary, RespondArtifact,
};
use crate::capture::observer::{CaptureEvent, Collaborator, CycleIds};
use crate::capture::store::ArtifactStore;
use crate::http::headers::RestoredHeaders;
use crate::observability::metrics;

/// Where a cycle is in its announcement sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CycleState {
    Created,
    BeginPending,
    RespondPending,
    FinishPending,
    Done,
    Failed,
}

/// Resolves to whether the previous stage was announced.
type Gate = oneshot::Receiver<bool>;

/// Completion of one stage task: `true` when its event was announced.
pub type StageHandle = JoinHandle<bool>;

/// Announces `request-error` at most once per cycle.
///
/// Cloned into every task that can observe a terminal failure (request body
/// tee, response pump, relay).
#[derive(Clone)]
pub struct FailureHandle {
    request_id: String,
    observer: Arc<dyn Collaborator>,
    state: Arc<watch::Sender<CycleState>>,
    fired: Arc<AtomicBool>,
}

impl FailureHandle {
    /// Announce the error. Returns false if the cycle had already failed.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let message = message.into();
        tracing::error!(request_id = %self.request_id, error = %message, "Capture cycle failed");
        let event = CaptureEvent::Error {
            request_id: self.request_id.clone(),
            message,
        };
        // under the state lock, so no stage announcement can slip in after it
        self.state.send_modify(|state| {
            *state = CycleState::Failed;
            self.observer.announce(event);
        });
        true
    }

    pub fn has_failed(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Persists and announces the begin/respond/finish stages of one cycle.
pub struct CycleRecorder {
    ids: CycleIds,
    start_time: u64,
    store: Arc<dyn ArtifactStore>,
    observer: Arc<dyn Collaborator>,
    state: Arc<watch::Sender<CycleState>>,
    failure: FailureHandle,
    /// Gate of the most recently scheduled stage.
    gate: Option<Gate>,
}

impl CycleRecorder {
    pub fn new(ids: CycleIds, store: Arc<dyn ArtifactStore>, observer: Arc<dyn Collaborator>) -> Self {
        let (state, _) = watch::channel(CycleState::Created);
        let state = Arc::new(state);
        let failure = FailureHandle {
            request_id: ids.request_id.clone(),
            observer: observer.clone(),
            state: state.clone(),
            fired: Arc::new(AtomicBool::new(false)),
        };
        Self {
            ids,
            start_time: now_millis(),
            store,
            observer,
            state,
            failure,
            gate: None,
        }
    }

    pub fn ids(&self) -> &CycleIds {
        &self.ids
    }

    pub fn request_id(&self) -> &str {
        &self.ids.request_id
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn store(&self) -> Arc<dyn ArtifactStore> {
        self.store.clone()
    }

    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    pub fn failure_handle(&self) -> FailureHandle {
        self.failure.clone()
    }

    /// Announce `request-error`; later stages may still be scheduled but the
    /// state stays `Failed`.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.failure.fail(message)
    }

    /// Stage 1: `req-*.json`, then `request-begin`.
    pub fn begin(&mut self, artifact: BeginArtifact) -> StageHandle {
        let event = CaptureEvent::Begin(artifact.summary.clone());
        self.advance(CycleState::BeginPending);
        self.schedule(ArtifactKind::RequestMeta, &artifact, event, CycleState::RespondPending)
    }

    /// Stage 2: `res-*.json`, then `request-respond` once begin was announced.
    pub fn respond(&mut self, status: StatusCode, headers: RestoredHeaders) -> StageHandle {
        let response_time = now_millis();
        let artifact = RespondArtifact {
            request_id: self.ids.request_id.clone(),
            status_code: status.as_u16(),
            headers,
            response_time,
            response_elapse: response_time.saturating_sub(self.start_time),
        };
        let event = CaptureEvent::Respond {
            request_id: self.ids.request_id.clone(),
        };
        self.schedule(ArtifactKind::ResponseMeta, &artifact, event, CycleState::FinishPending)
    }

    /// Stage 3: `fin-*.json`, then `request-finish` once respond was announced.
    pub fn finish(&mut self, size: u64, maybe_json: bool) -> StageHandle {
        let finish_time = now_millis();
        let finish_elapse = finish_time.saturating_sub(self.start_time);
        let artifact = FinishArtifact {
            request_id: self.ids.request_id.clone(),
            size,
            maybe_json,
            finish_time,
            finish_elapse,
        };
        let event = CaptureEvent::Finish {
            request_id: self.ids.request_id.clone(),
            summary: FinishSummary {
                size,
                maybe_json,
                finish_elapse,
            },
        };
        self.schedule(ArtifactKind::FinishMeta, &artifact, event, CycleState::Done)
    }

    fn advance(&self, next: CycleState) {
        advance(&self.state, next);
    }

    fn schedule<T: Serialize>(
        &mut self,
        kind: ArtifactKind,
        artifact: &T,
        event: CaptureEvent,
        on_announce: CycleState,
    ) -> StageHandle {
        let name = kind.file_name(&self.ids.cycle_id);
        let payload = serde_json::to_vec(artifact);
        let prior = self.gate.take();
        let (open_next, next_gate) = oneshot::channel();
        self.gate = Some(next_gate);

        let store = self.store.clone();
        let observer = self.observer.clone();
        let state = self.state.clone();
        let request_id = self.ids.request_id.clone();

        tokio::spawn(async move {
            let written = match payload {
                Ok(bytes) => match store.write_json(name.clone(), bytes).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(request_id = %request_id, artifact = %name, error = %e, "Artifact write failed");
                        metrics::record_artifact_failure(kind.label());
                        false
                    }
                },
                Err(e) => {
                    tracing::warn!(request_id = %request_id, artifact = %name, error = %e, "Artifact serialization failed");
                    false
                }
            };

            // a dropped gate means the prior stage task died; treat as skipped
            let prior_announced = match prior {
                Some(gate) => gate.await.unwrap_or(false),
                None => true,
            };

            let announced = written && prior_announced && announce_unless_failed(&state, observer.as_ref(), event, on_announce);
            if !announced && written {
                tracing::debug!(request_id = %request_id, stage = kind.label(), "Stage skipped after earlier loss or failure");
            }
            let _ = open_next.send(announced);
            announced
        })
    }
}

/// Announce `event` and advance to `next`, atomically with respect to
/// [`FailureHandle::fail`]. A failed cycle announces nothing more.
fn announce_unless_failed(
    state: &watch::Sender<CycleState>,
    observer: &dyn Collaborator,
    event: CaptureEvent,
    next: CycleState,
) -> bool {
    let mut announced = false;
    state.send_if_modified(|current| {
        if *current == CycleState::Failed {
            return false;
        }
        observer.announce(event);
        announced = true;
        if *current >= next {
            return false;
        }
        *current = next;
        true
    });
    announced
}

/// Move forward only; `Failed` is terminal.
fn advance(state: &watch::Sender<CycleState>, next: CycleState) {
    state.send_if_modified(|current| {
        if *current == CycleState::Failed || *current >= next {
            return false;
        }
        *current = next;
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::artifacts::BeginSummary;
    use crate::capture::store::testing::MemoryStore;
    use crate::dispatch::descriptor::Protocol;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<CaptureEvent>>,
    }

    impl Recording {
        fn names(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(CaptureEvent::name).collect()
        }
    }

    impl Collaborator for Recording {
        fn allocate_ids(&self) -> BoxFuture<'static, crate::error::ProxyResult<CycleIds>> {
            futures_util::future::ready(Ok(ids())).boxed()
        }

        fn announce(&self, event: CaptureEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn ids() -> CycleIds {
        CycleIds {
            request_id: "r1".into(),
            cycle_id: "c1".into(),
        }
    }

    fn begin_artifact(start_time: u64) -> BeginArtifact {
        BeginArtifact {
            summary: BeginSummary {
                request_id: "r1".into(),
                cycle_id: "c1".into(),
                start_time,
                protocol: Protocol::Http,
                hostname: "api.test".into(),
                port: 80,
                method: "GET".into(),
                pathname: "/".into(),
            },
            search: None,
            headers: RestoredHeaders::default(),
        }
    }

    fn recorder(store: &MemoryStore, observer: &Arc<Recording>) -> CycleRecorder {
        CycleRecorder::new(ids(), Arc::new(store.clone()), observer.clone())
    }

    #[tokio::test]
    async fn announcements_follow_stage_order_despite_slow_writes() {
        let store = MemoryStore::default();
        // begin's write completes last, finish's first
        store.delay("req-c1.json", Duration::from_millis(120));
        store.delay("res-c1.json", Duration::from_millis(60));

        let observer = Arc::new(Recording::default());
        let mut rec = recorder(&store, &observer);
        let start = rec.start_time();

        let begin = rec.begin(begin_artifact(start));
        let respond = rec.respond(StatusCode::OK, RestoredHeaders::default());
        let finish = rec.finish(7, true);

        assert!(finish.await.unwrap());
        assert!(respond.await.unwrap());
        assert!(begin.await.unwrap());

        assert_eq!(observer.names(), ["request-begin", "request-respond", "request-finish"]);
        assert_eq!(rec.state(), CycleState::Done);

        let fin = store.json("fin-c1.json").unwrap();
        assert_eq!(fin["size"], 7);
        assert_eq!(fin["maybeJSON"], true);
        assert_eq!(fin["requestID"], "r1");
        let res = store.json("res-c1.json").unwrap();
        assert_eq!(res["statusCode"], 200);
    }

    #[tokio::test]
    async fn failed_respond_write_skips_respond_and_finish() {
        #[derive(Clone)]
        struct FailRespond(MemoryStore);

        impl ArtifactStore for FailRespond {
            fn write_json(&self, name: String, contents: Vec<u8>) -> BoxFuture<'static, std::io::Result<()>> {
                if name.starts_with("res-") {
                    return futures_util::future::ready(Err(std::io::Error::other("disk full"))).boxed();
                }
                self.0.write_json(name, contents)
            }

            fn create_body(&self, name: String) -> BoxFuture<'static, std::io::Result<crate::capture::store::BodySink>> {
                self.0.create_body(name)
            }
        }

        let store = MemoryStore::default();
        let observer = Arc::new(Recording::default());
        let mut rec = CycleRecorder::new(ids(), Arc::new(FailRespond(store.clone())), observer.clone());

        let start = rec.start_time();
        assert!(rec.begin(begin_artifact(start)).await.unwrap());
        assert!(!rec.respond(StatusCode::OK, RestoredHeaders::default()).await.unwrap());
        assert!(!rec.finish(1, false).await.unwrap());

        assert_eq!(observer.names(), ["request-begin"]);
        // the finish artifact itself was still written
        assert!(store.get("fin-c1.json").is_some());
        assert_eq!(rec.state(), CycleState::RespondPending);
    }

    #[tokio::test]
    async fn failure_is_announced_once() {
        let store = MemoryStore::default();
        let observer = Arc::new(Recording::default());
        let mut rec = recorder(&store, &observer);

        let start = rec.start_time();
        rec.begin(begin_artifact(start)).await.unwrap();
        let handle = rec.failure_handle();
        assert!(handle.fail("origin reset"));
        assert!(!rec.fail("second failure"));
        assert!(handle.has_failed());

        assert_eq!(observer.names(), ["request-begin", "request-error"]);
        assert_eq!(rec.state(), CycleState::Failed);
    }

    #[tokio::test]
    async fn no_stage_is_announced_after_failure() {
        let store = MemoryStore::default();
        store.delay("res-c1.json", Duration::from_millis(60));
        let observer = Arc::new(Recording::default());
        let mut rec = recorder(&store, &observer);

        let start = rec.start_time();
        assert!(rec.begin(begin_artifact(start)).await.unwrap());
        let respond = rec.respond(StatusCode::OK, RestoredHeaders::default());
        // mid-stream origin error while res-*.json is still being written
        assert!(rec.fail("origin reset"));
        let finish = rec.finish(3, false);

        assert!(!respond.await.unwrap());
        assert!(!finish.await.unwrap());
        assert_eq!(observer.names(), ["request-begin", "request-error"]);
        assert!(store.get("res-c1.json").is_some());
        assert_eq!(rec.state(), CycleState::Failed);
    }

    #[tokio::test]
    async fn state_moves_through_pending_stages() {
        let store = MemoryStore::default();
        store.delay("req-c1.json", Duration::from_millis(50));
        let observer = Arc::new(Recording::default());
        let mut rec = recorder(&store, &observer);
        assert_eq!(rec.state(), CycleState::Created);

        let start = rec.start_time();
        let begin = rec.begin(begin_artifact(start));
        assert_eq!(rec.state(), CycleState::BeginPending);
        begin.await.unwrap();
        assert_eq!(rec.state(), CycleState::RespondPending);

        rec.respond(StatusCode::OK, RestoredHeaders::default()).await.unwrap();
        assert_eq!(rec.state(), CycleState::FinishPending);
    }
}

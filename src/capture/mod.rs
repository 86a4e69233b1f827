//! Capture subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher
//!     → observer.rs (allocate requestID/cycleID; announce events)
//!     → recorder.rs (begin → respond → finish, strictly ordered)
//!         → artifacts.rs (JSON artifact shapes, file names)
//!         → store.rs (write JSON, stream .dat bodies)
//! ```
//!
//! # Design Decisions
//! - A stage is announced only after its artifact is on disk
//! - Artifact loss never affects what the caller receives

pub mod artifacts;
pub mod observer;
pub mod recorder;
pub mod store;

pub use artifacts::ArtifactKind;
pub use observer::{CaptureEvent, Collaborator, CycleIds, LocalCollaborator};
pub use recorder::{CycleRecorder, CycleState, FailureHandle};
pub use store::{ArtifactStore, FsArtifactStore};

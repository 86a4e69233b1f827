//! Capture proxy library.
//!
//! An HTTP forwarding proxy that records every request/response cycle
//! passing through it.
//!
//! ```text
//!   caller ──▶ http::server ──▶ dispatch ──┬─▶ relay ──────────▶ origin
//!                                 │        └─▶ static_files ──▶ disk
//!                                 ▼
//!                              rewrite
//!
//!   relay / static_files ──▶ capture (artifacts + ordered events)
//! ```

// Core pipeline
pub mod capture;
pub mod dispatch;
pub mod http;
pub mod relay;
pub mod rewrite;
pub mod static_files;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;

pub use capture::{ArtifactStore, Collaborator, FsArtifactStore, LocalCollaborator};
pub use config::ProxyConfig;
pub use dispatch::Dispatcher;
pub use error::{ProxyError, ProxyResult};
pub use http::HttpServer;
pub use lifecycle::Shutdown;

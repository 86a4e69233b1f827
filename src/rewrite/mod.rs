//! Rewrite subsystem.
//!
//! # Data Flow
//! ```text
//! OutboundDescriptor (protocol, host, port, path)
//!     → engine.rs (scan rule table in order)
//!     → rule.rs (compile entry, match, rewrite)
//!     → OutboundDescriptor' (or unchanged on no match)
//! ```
//!
//! # Design Decisions
//! - Rule table is read-only input, loaded once by the config layer
//! - Deterministic: same input always matches same rule
//! - First match wins (table order)

pub mod engine;
pub mod rule;

pub use engine::RewriteEngine;
pub use rule::{RewriteError, RewriteRule};

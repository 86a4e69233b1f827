//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum, every method and path to one fallback handler)
//!     → Dispatcher (capture cycle)
//!     → streamed response back to the caller
//!
//! headers.rs is shared by both directions: raw wire order + canonical map
//! wire.rs re-reads heads off the socket to keep header spelling
//! ```

pub mod headers;
pub mod server;
pub mod wire;

pub use headers::{HeaderSet, RestoredHeaders};
pub use server::HttpServer;

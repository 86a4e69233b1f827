//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Ctrl+C / SIGTERM → Shutdown::trigger → server stops accepting
//!     → in-flight cycles finish streaming → process exits
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;

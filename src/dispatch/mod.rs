//! Request dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → descriptor.rs (absolute-form or Host-based target → OutboundDescriptor)
//!     → dispatcher.rs (IDs, header hygiene, rewrite, branch)
//!     → relay / static files
//! ```

pub mod descriptor;
pub mod dispatcher;

pub use descriptor::{OutboundDescriptor, Protocol};
pub use dispatcher::Dispatcher;

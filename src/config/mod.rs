//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → shared read-only with dispatcher, rewrite engine, static server
//! ```
//!
//! # Design Decisions
//! - Config is loaded once at startup and never mutated at request time
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CaptureConfig, CorsConfig, ListenerConfig, ObservabilityConfig, PortValue, ProxyConfig,
    RewriteRuleConfig, RuleEndpointConfig, TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};

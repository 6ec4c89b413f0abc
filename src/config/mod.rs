//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → lifecycle::Gateway applies it to the registry and manager
//!
//! On change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Gateway applies the difference (Del removed routes, Add the rest)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, DriverConfig, GatewayConfig, LogFormat, ObservabilityConfig, RouterConfig,
    ServerConfig, TimeoutConfig,
};
pub use validation::ValidationError;
pub use watcher::ConfigWatcher;

//! Edge gateway library.
//!
//! Routes requests arriving on dynamically managed ports through driver
//! chains to upstream services.

pub mod admin;
pub mod chain;
pub mod config;
pub mod context;
pub mod drivers;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod router;
pub mod upstream;

pub use config::GatewayConfig;
pub use lifecycle::{Gateway, Shutdown};
pub use router::Manager;

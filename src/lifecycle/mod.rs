//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Registry + built-in drivers → client → manager → apply config
//!
//! Reload (startup.rs):
//!     ConfigWatcher update → Gateway::apply (diff against live routes)
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger → Gateway::shutdown (Manager::cancel once)
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, drain, close
//! - Drains are bounded by `timeouts.drain_secs`

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::wait_for_shutdown;
pub use startup::{Gateway, GatewayError};

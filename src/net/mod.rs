//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake, SNI certificate selection)
//!     → connection.rs (lifecycle tracking for drain)
//!     → Hand off to the port's server
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is per port and driven by the routes on that port

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use tls::{CertificateConfig, Certs, SniResolver, TlsError};

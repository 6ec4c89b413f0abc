//! Routing and port servers.
//!
//! # Data Flow
//! ```text
//! Manager::add(port, RouteSpec)
//!     → route.rs (compile rules, build the chain)
//!     → table.rs (per-port upsert, sorted snapshot)
//!     → server.rs (bind + serve on the 0→1 transition)
//!
//! Request on a port
//!     → server.rs dispatch → table.find → Route::serve → chain → fast_finish
//! ```
//!
//! # Design Decisions
//! - A port's server exists iff its table has routes
//! - Routing failures become responses, never errors

pub mod manager;
pub mod matcher;
pub mod route;
pub mod server;
pub mod table;

pub use manager::{Manager, ManagerError, PortStatus};
pub use route::{Protocol, Route, RouteError, RouteRules, RouteSpec};
pub use server::{ConnectionInfo, HttpServer, ServerSettings};
pub use table::RouteTable;

/// Body of the 503 for a disabled route.
pub const ROUTE_DISABLED: &str = "route is disabled";

/// Body of the 404 when nothing matches.
pub const ROUTE_NOT_FOUND: &str = "no route matched";

/// Body of the 413 for oversized requests.
pub const BODY_TOO_LARGE: &str = "request body too large";

/// Message when a request outlives `timeouts.request_secs`.
pub const REQUEST_TIMED_OUT: &str = "request did not complete in time";

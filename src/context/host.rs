//! Outbound Host header policy.
//!
//! # Responsibilities
//! - Split a proxy target address into scheme and host
//! - Decide which Host header an outbound request carries
//!
//! # Design Decisions
//! - The decision is a pure function of (policy, original, target, rewrite)
//! - A bare address without `scheme://` is treated as `http`

use serde::{Deserialize, Serialize};

/// How the outbound Host header is chosen for a proxied call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassHost {
    /// Keep the Host header the client sent.
    #[default]
    Pass,
    /// Use the host of the resolved upstream node.
    Node,
    /// Use an explicitly configured host.
    Rewrite,
}

impl std::fmt::Display for PassHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassHost::Pass => write!(f, "pass"),
            PassHost::Node => write!(f, "node"),
            PassHost::Rewrite => write!(f, "rewrite"),
        }
    }
}

/// Supplies the host policy for the upstream a request is sent to.
pub trait UpstreamHostHandler: Send + Sync {
    /// Returns the policy and the configured rewrite host (empty unless `Rewrite`).
    fn pass_host(&self) -> (PassHost, &str);
}

/// Host header for an outbound request.
pub fn outbound_host<'a>(
    policy: PassHost,
    original: &'a str,
    target: &'a str,
    rewrite: &'a str,
) -> &'a str {
    match policy {
        PassHost::Pass => original,
        PassHost::Node => target,
        PassHost::Rewrite => rewrite,
    }
}

/// Split `scheme://host[:port]` into a lower-cased scheme and the host part.
pub fn read_address(address: &str) -> (String, &str) {
    match address.find("://") {
        Some(i) if i > 0 => (address[..i].to_ascii_lowercase(), &address[i + 3..]),
        _ => ("http".to_string(), address),
    }
}

//! Discovery contract and node-list parsing.
//!
//! # Responsibilities
//! - `Discovery`: resolve a service's discovery config into an `App`
//! - `App`: the node list a balance handler selects from
//! - Parse the `"host:port [weight=N];..."` node syntax

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::upstream::node::Node;

/// Largest accepted node weight. The balancer expands weights into slots.
pub const MAX_WEIGHT: u32 = 1000;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no nodes in discovery config {0:?}")]
    Empty(String),

    #[error("invalid node {node:?}: {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("discovery {0} not found")]
    UnknownDiscovery(String),
}

/// Resolves a service's node list.
pub trait Discovery: Send + Sync {
    fn get_app(&self, config: &str) -> Result<Arc<App>, DiscoveryError>;
}

/// A resolved set of nodes with its passive-health settings.
#[derive(Debug)]
pub struct App {
    nodes: Vec<Arc<Node>>,
    down_period: Duration,
}

impl App {
    pub fn new(nodes: Vec<Arc<Node>>, down_period: Duration) -> Self {
        Self { nodes, down_period }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// How long a failed node is skipped. Zero disables passive health.
    pub fn down_period(&self) -> Duration {
        self.down_period
    }
}

/// Parse `"10.0.0.1:80 weight=3; 10.0.0.2:80"` into nodes.
pub fn parse_nodes(config: &str) -> Result<Vec<Arc<Node>>, DiscoveryError> {
    let mut nodes = Vec::new();
    for entry in config.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split_whitespace();
        let addr = parts.next().unwrap_or_default();
        validate_addr(addr).map_err(|reason| DiscoveryError::InvalidNode {
            node: entry.to_string(),
            reason,
        })?;

        let mut weight = 1;
        for option in parts {
            match option.split_once('=') {
                Some(("weight", value)) => {
                    weight = value.parse::<u32>().map_err(|e| DiscoveryError::InvalidNode {
                        node: entry.to_string(),
                        reason: format!("weight: {}", e),
                    })?;
                    if weight > MAX_WEIGHT {
                        return Err(DiscoveryError::InvalidNode {
                            node: entry.to_string(),
                            reason: format!("weight {} exceeds {}", weight, MAX_WEIGHT),
                        });
                    }
                }
                _ => {
                    return Err(DiscoveryError::InvalidNode {
                        node: entry.to_string(),
                        reason: format!("unknown option {:?}", option),
                    })
                }
            }
        }
        nodes.push(Arc::new(Node::new(addr, weight)));
    }

    if nodes.is_empty() {
        return Err(DiscoveryError::Empty(config.to_string()));
    }
    Ok(nodes)
}

fn validate_addr(addr: &str) -> Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| "missing port".to_string())?;
    if host.is_empty() {
        return Err("missing host".to_string());
    }
    port.parse::<u16>()
        .map(|_| ())
        .map_err(|e| format!("port: {}", e))
}

//! Weighted round-robin balancing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::context::EoContext;
use crate::upstream::discovery::App;
use crate::upstream::node::Node;

#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("service {0} has no nodes")]
    NoNodes(String),

    #[error("every node of service {0} is down")]
    AllDown(String),
}

/// Picks the node for the next outbound attempt.
pub trait BalanceHandler: Send + Sync {
    fn select(&self, ctx: &dyn EoContext) -> Result<Arc<Node>, BalanceError>;

    /// Scheme used to reach the selected nodes.
    fn scheme(&self) -> &str;

    /// How long a node that failed a call is skipped.
    fn down_period(&self) -> Duration;
}

/// Round-robin selector over weighted slots.
/// Stores an internal counter to rotate through them.
#[derive(Debug)]
pub struct RoundRobin {
    service: String,
    scheme: String,
    app: Arc<App>,
    slots: Vec<usize>,
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new(service: impl Into<String>, scheme: impl Into<String>, app: Arc<App>) -> Self {
        let slots = weighted_slots(app.nodes());
        Self {
            service: service.into(),
            scheme: scheme.into(),
            app,
            slots,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn app(&self) -> &Arc<App> {
        &self.app
    }
}

/// Interleave node indexes by weight: weights `[3, 1]` give `[0, 1, 0, 0]`.
fn weighted_slots(nodes: &[Arc<Node>]) -> Vec<usize> {
    let max = nodes.iter().map(|n| n.weight()).max().unwrap_or(0);
    let mut slots = Vec::new();
    for round in 0..max {
        for (index, node) in nodes.iter().enumerate() {
            if node.weight() > round {
                slots.push(index);
            }
        }
    }
    slots
}

impl BalanceHandler for RoundRobin {
    fn select(&self, _ctx: &dyn EoContext) -> Result<Arc<Node>, BalanceError> {
        if self.slots.is_empty() {
            return Err(BalanceError::NoNodes(self.service.clone()));
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = self.slots.len();
        for i in 0..len {
            let node = &self.app.nodes()[self.slots[(start + i) % len]];
            if node.is_available() {
                return Ok(node.clone());
            }
        }
        Err(BalanceError::AllDown(self.service.clone()))
    }

    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn down_period(&self) -> Duration {
        self.app.down_period()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextState, HttpContext, RequestReader, UpstreamClient};
    use axum::http::{HeaderMap, Method, Uri, Version};
    use bytes::Bytes;

    fn ctx() -> HttpContext {
        let reader = RequestReader::new(
            Method::GET,
            Uri::from_static("/"),
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:1000".parse().unwrap(),
            false,
        );
        HttpContext::new(ContextState::new(80, reader, Arc::new(UpstreamClient::new().unwrap())))
    }

    fn app(weights: &[u32]) -> Arc<App> {
        let nodes = weights
            .iter()
            .enumerate()
            .map(|(i, w)| Arc::new(Node::new(format!("10.0.0.{}:80", i + 1), *w)))
            .collect();
        Arc::new(App::new(nodes, Duration::from_secs(30)))
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new("svc", "http", app(&[1, 1]));
        let ctx = ctx();

        assert_eq!(lb.select(&ctx).unwrap().addr(), "10.0.0.1:80");
        assert_eq!(lb.select(&ctx).unwrap().addr(), "10.0.0.2:80");
        assert_eq!(lb.select(&ctx).unwrap().addr(), "10.0.0.1:80");
    }

    #[test]
    fn test_weights_shape_distribution() {
        let lb = RoundRobin::new("svc", "http", app(&[3, 1]));
        let ctx = ctx();

        let picks: Vec<String> = (0..8).map(|_| lb.select(&ctx).unwrap().addr().to_string()).collect();
        let first = picks.iter().filter(|a| *a == "10.0.0.1:80").count();
        assert_eq!(first, 6);
    }

    #[test]
    fn test_down_nodes_are_skipped() {
        let app = app(&[1, 1]);
        app.nodes()[0].mark_failure(Duration::from_secs(60));
        let lb = RoundRobin::new("svc", "http", app.clone());
        let ctx = ctx();

        for _ in 0..4 {
            assert_eq!(lb.select(&ctx).unwrap().addr(), "10.0.0.2:80");
        }

        app.nodes()[1].mark_failure(Duration::from_secs(60));
        assert!(matches!(lb.select(&ctx), Err(BalanceError::AllDown(_))));
    }

    #[test]
    fn test_empty_app() {
        let lb = RoundRobin::new("svc", "http", app(&[]));
        assert!(matches!(lb.select(&ctx()), Err(BalanceError::NoNodes(_))));
    }
}

//! Upstream node abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream `host:port` with a weight
//! - Track passive health: a failed node sits out a down period
//! - Count in-flight calls for introspection

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single upstream server.
#[derive(Debug)]
pub struct Node {
    addr: String,
    weight: u32,
    /// Unix millis until which the node is skipped. Zero when up.
    down_until: AtomicU64,
    consecutive_failures: AtomicUsize,
    active_calls: AtomicUsize,
}

impl Node {
    pub fn new(addr: impl Into<String>, weight: u32) -> Self {
        Self {
            addr: addr.into(),
            weight: weight.max(1),
            down_until: AtomicU64::new(0),
            consecutive_failures: AtomicUsize::new(0),
            active_calls: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// True unless the node is inside its down period.
    pub fn is_available(&self) -> bool {
        self.down_until.load(Ordering::Relaxed) <= now_millis()
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Relaxed)
    }

    /// Report a successful call.
    pub fn mark_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.down_until.store(0, Ordering::Relaxed);
    }

    /// Report a failed call. A zero `down_period` only counts the failure.
    pub fn mark_failure(&self, down_period: Duration) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if down_period.is_zero() {
            return;
        }
        self.down_until
            .store(now_millis() + down_period.as_millis() as u64, Ordering::Relaxed);
        tracing::warn!(
            node = %self.addr,
            failures,
            down_ms = down_period.as_millis() as u64,
            "Node marked down"
        );
    }

    /// Count an in-flight call until the guard drops.
    pub fn track_call(&self) -> CallGuard<'_> {
        self.active_calls.fetch_add(1, Ordering::Relaxed);
        CallGuard { node: self }
    }
}

/// Decrements the node's in-flight count on drop.
#[derive(Debug)]
pub struct CallGuard<'a> {
    node: &'a Node,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.node.active_calls.fetch_sub(1, Ordering::Relaxed);
    }
}

//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections per server
//! - Let a draining server wait until its connections are gone

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Relaxed ordering is enough: ids only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tracks live connections; the count is published on a watch channel.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Record a new connection. The guard decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active.send_modify(|n| *n += 1);
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until no connection is live, or `timeout` passes.
    /// Returns true when idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);
        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_when_last_guard_drops() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_idle_times_out() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track();
        assert!(!tracker.wait_idle(Duration::from_millis(50)).await);
    }
}

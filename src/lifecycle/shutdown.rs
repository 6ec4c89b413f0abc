//! Shutdown coordination for the gateway.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Long-running tasks (admin API, config reload loop) subscribe; the port
/// servers are stopped separately through `Gateway::shutdown`.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal. Returns false if it was already triggered.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        let receivers = self.tx.send(()).unwrap_or(0);
        tracing::info!(receivers, "Shutdown triggered");
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Number of tasks still subscribed.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

//! Configuration file watcher for hot reload.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::GatewayConfig;

/// A watcher that monitors the configuration file for changes.
///
/// Only configurations that load and validate are forwarded; a broken edit is
/// logged and the running state stays as it is.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<GatewayConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. Events stop when the returned watcher is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(path = %path.display(), "Config file change detected, reloading");
                        match load_config(&path) {
                            Ok(new_config) => {
                                if tx.send(new_config).is_err() {
                                    tracing::debug!("Config receiver gone, dropping reload");
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %self.path.display(), "Config watcher started");
        Ok(watcher)
    }
}

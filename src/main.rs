//! Edge gateway
//!
//! An API gateway dispatch engine built with Tokio, hyper and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                     EDGE GATEWAY                      │
//!                        │                                                       │
//!   Client Request       │  ┌─────────┐   ┌──────────┐   ┌──────────────┐       │
//!   ─────────────────────┼─▶│   net   │──▶│  router  │──▶│   context    │       │
//!                        │  │listener │   │  server  │   │ (http/grpc)  │       │
//!                        │  │ + tls   │   │ + table  │   └──────┬───────┘       │
//!                        │  └─────────┘   └──────────┘          │               │
//!                        │                                      ▼               │
//!                        │                              ┌──────────────┐        │
//!                        │                              │    chain     │        │
//!                        │                              │ auth plugins │        │
//!                        │                              └──────┬───────┘        │
//!                        │                                     ▼                │
//!   Client Response      │                              ┌──────────────┐        │
//!   ◀────────────────────┼──────────── fast_finish ◀────│   upstream   │◀───────┼─── Upstream
//!                        │                              │ balance/send │        │    Node
//!                        │                              └──────────────┘        │
//!                        │                                                       │
//!                        │  ┌─────────────────────────────────────────────────┐ │
//!                        │  │  config · drivers · observability · lifecycle   │ │
//!                        │  └─────────────────────────────────────────────────┘ │
//!                        └──────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use edge_gateway::admin::{self, AdminState};
use edge_gateway::config::{load_config, ConfigWatcher};
use edge_gateway::lifecycle::{wait_for_shutdown, Gateway, Shutdown};
use edge_gateway::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "edge-gateway", version, about = "API gateway dispatch engine")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Overrides `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.observability.log_level.clone());
    logging::init(&level, config.observability.log_format)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "edge-gateway starting");

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let gateway = Arc::new(Gateway::new(&config)?);
    gateway.apply(&config).await?;

    let shutdown = Shutdown::new();

    let admin_task = if config.admin.enabled {
        let addr = config.admin.bind_address.parse()?;
        let state = AdminState::new(Arc::clone(&gateway), &config.admin.api_key);
        let rx = shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = admin::serve(addr, state, rx).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }))
    } else {
        None
    };

    let (watcher, updates) = ConfigWatcher::new(&args.config);
    let _watcher = watcher.run()?;
    let reload_task = tokio::spawn(Arc::clone(&gateway).watch(updates, shutdown.subscribe()));

    wait_for_shutdown().await?;
    shutdown.trigger();

    gateway.shutdown().await;
    if let Some(task) = admin_task {
        let _ = task.await;
    }
    let _ = reload_task.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Pick the log level from config, overridable by `RUST_LOG`
//!
//! # Design Decisions
//! - JSON format for production, pretty format for development

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(level: &str) -> String {
    format!("edge_gateway={level},gateway::access={level},tower_http=info,warn")
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(level: &str, format: LogFormat) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    }
}

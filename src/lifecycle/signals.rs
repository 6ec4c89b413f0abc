//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGTERM or SIGINT (Ctrl-C elsewhere)
//! - Report which signal arrived so the caller can start shutdown
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Config reload comes from the file watcher, not from SIGHUP

/// Resolve when the process is asked to stop. Returns the signal name.
pub async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        tracing::info!(signal = name, "Shutdown signal received");
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!(signal = "ctrl_c", "Shutdown signal received");
        Ok("ctrl_c")
    }
}

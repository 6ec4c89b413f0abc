//! Upstream subsystem.
//!
//! # Data Flow
//! ```text
//! ServiceConfig
//!     → discovery (node list as an App)
//!     → balance.rs (weighted round robin over available nodes)
//!     → UpstreamHandler (terminal chain link)
//!         → select node → ctx.send_to(scheme://node, timeout)
//!         → on error: mark node, retry against a fresh selection
//! ```
//!
//! # Design Decisions
//! - Retries live here, never inside `send_to`
//! - The handler records outcomes on the context and never writes a response
//! - A gRPC client's `grpc-timeout` can only shorten the per-call timeout

pub mod balance;
pub mod discovery;
pub mod node;
pub mod service;

use async_trait::async_trait;
use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{ChainError, Filter, Next};
use crate::context::{ContextError, EoContext, ErrorFinisher, UpstreamHostHandler};

pub use balance::{BalanceError, BalanceHandler, RoundRobin};
pub use discovery::{App, Discovery, DiscoveryError};
pub use node::Node;
pub use service::{HttpService, ServiceConfig};

/// A resolvable backend: where to send, how to pick, which Host to use.
pub trait Service: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn balance(&self) -> Arc<dyn BalanceHandler>;

    fn upstream_host(&self) -> Arc<dyn UpstreamHostHandler>;

    /// The terminal chain link that proxies to this service.
    fn handler(&self) -> Arc<dyn Filter>;
}

/// Builds upstream handlers.
pub struct Upstream;

impl Upstream {
    /// Handler that tries once plus `retry` more times, each call bounded by `timeout`.
    pub fn create(id: impl Into<String>, retry: usize, timeout: Duration) -> Arc<UpstreamHandler> {
        Arc::new(UpstreamHandler {
            id: id.into(),
            retry,
            timeout,
        })
    }
}

/// Terminal link: select a node and proxy, retrying on failure.
#[derive(Debug)]
pub struct UpstreamHandler {
    id: String,
    retry: usize,
    timeout: Duration,
}

impl UpstreamHandler {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn retry(&self) -> usize {
        self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Per-call timeout for this request.
    pub fn effective_timeout(&self, ctx: &mut dyn EoContext) -> Duration {
        match ctx.as_grpc().ok().and_then(|grpc| grpc.client_timeout()) {
            Some(client) => self.timeout.min(client),
            None => self.timeout,
        }
    }
}

#[async_trait]
impl Filter for UpstreamHandler {
    async fn do_filter(&self, ctx: &mut dyn EoContext, _next: Next<'_>) -> Result<(), ChainError> {
        let balance = ctx
            .balance()
            .ok_or(ContextError::MissingHandler("balance"))?;
        let timeout = self.effective_timeout(ctx);

        let mut attempts = 0;
        loop {
            let node = match balance.select(&*ctx) {
                Ok(node) => node,
                Err(error) => {
                    if attempts == 0 {
                        ctx.set_finish_handler(Arc::new(ErrorFinisher::new(
                            StatusCode::SERVICE_UNAVAILABLE,
                            error.to_string(),
                        )));
                    }
                    return Err(error.into());
                }
            };
            attempts += 1;

            let address = format!("{}://{}", balance.scheme(), node.addr());
            let result = {
                let _call = node.track_call();
                ctx.send_to(&address, timeout).await
            };

            match result {
                Ok(()) => {
                    node.mark_success();
                    return Ok(());
                }
                Err(error) => {
                    node.mark_failure(balance.down_period());
                    if attempts > self.retry {
                        return Err(ChainError::Upstream {
                            attempts,
                            source: error,
                        });
                    }
                    tracing::info!(
                        request_id = %ctx.request_id(),
                        upstream = %self.id,
                        attempt = attempts,
                        error = %error,
                        "Retrying upstream call"
                    );
                }
            }
        }
    }
}

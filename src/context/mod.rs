//! Per-request context.
//!
//! # Data Flow
//! ```text
//! Accepted request
//!     → state.rs (request id, labels, handlers, proxy history)
//!     → http.rs / grpc.rs (kind-specific capabilities)
//!     → chain links read and mutate the context
//!     → send_to (host policy → client.rs → upstream)
//!     → fast_finish (finish handler outcome | proxy error | upstream response)
//!     → complete handlers once the body is written
//! ```
//!
//! # Design Decisions
//! - Chain links see `&mut dyn EoContext`; only the dispatcher owns the
//!   concrete context, so only it can call `fast_finish`
//! - `fast_finish` consumes the context: a request finishes exactly once
//! - Kind-specific capabilities go through `as_http`/`as_grpc`, which fail
//!   with `ContextError::KindMismatch` on the wrong kind

pub mod client;
pub mod finish;
pub mod grpc;
pub mod host;
pub mod http;
pub mod request;
pub mod state;

use async_trait::async_trait;
use axum::http::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::upstream::{BalanceHandler, Service};

pub use client::{ClientFlavor, ProxyError, UpstreamClient};
pub use finish::{CompleteHandler, CompleteHandlers, ErrorFinisher, FinishHandler, Finisher, Outcome};
pub use grpc::{GrpcCode, GrpcContext};
pub use host::{outbound_host, read_address, PassHost, UpstreamHostHandler};
pub use http::HttpContext;
pub use request::{FinishedRequest, ProxyRecord, ProxyRequest, RequestReader};
pub use state::ContextState;

/// Route name label.
pub const LABEL_API: &str = "api";
/// Route id label.
pub const LABEL_API_ID: &str = "api_id";
/// Service name label.
pub const LABEL_SERVICE: &str = "service";
/// Service id label.
pub const LABEL_SERVICE_ID: &str = "service_id";
/// Client IP label.
pub const LABEL_IP: &str = "ip";

/// The wire kind of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Http,
    Grpc,
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextKind::Http => write!(f, "http"),
            ContextKind::Grpc => write!(f, "grpc"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("expected a {expected} context, got {actual}")]
    KindMismatch {
        expected: ContextKind,
        actual: ContextKind,
    },

    #[error("no {0} handler installed on the context")]
    MissingHandler(&'static str),
}

/// The context token passed through a chain.
#[async_trait]
pub trait EoContext: Send {
    fn kind(&self) -> ContextKind;

    fn state(&self) -> &ContextState;

    fn state_mut(&mut self) -> &mut ContextState;

    /// Proxy the current request to `address` (`scheme://host[:port]` or a
    /// bare host). Records the attempt, applies the host policy, and stores
    /// the response or the error on the context.
    async fn send_to(&mut self, address: &str, timeout: Duration) -> Result<(), ProxyError>;

    fn as_http(&mut self) -> Result<&mut HttpContext, ContextError> {
        Err(ContextError::KindMismatch {
            expected: ContextKind::Http,
            actual: self.kind(),
        })
    }

    fn as_grpc(&mut self) -> Result<&mut GrpcContext, ContextError> {
        Err(ContextError::KindMismatch {
            expected: ContextKind::Grpc,
            actual: self.kind(),
        })
    }

    fn request_id(&self) -> &str {
        self.state().request_id()
    }

    fn port(&self) -> u16 {
        self.state().port()
    }

    fn accepted_at(&self) -> SystemTime {
        self.state().accepted_at()
    }

    fn request(&self) -> &RequestReader {
        self.state().request()
    }

    fn proxy(&self) -> &ProxyRequest {
        self.state().proxy()
    }

    fn proxy_mut(&mut self) -> &mut ProxyRequest {
        self.state_mut().proxy_mut()
    }

    fn proxies(&self) -> &[ProxyRecord] {
        self.state().proxies()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.state().label(key)
    }

    fn labels(&self) -> &HashMap<String, String> {
        self.state().labels()
    }

    fn set_label(&mut self, key: &str, value: &str) {
        self.state_mut().set_label(key, value)
    }

    fn complete_handler(&self) -> Option<Arc<dyn CompleteHandler>> {
        self.state().complete_handler()
    }

    fn set_complete_handler(&mut self, handler: Arc<dyn CompleteHandler>) {
        self.state_mut().set_complete_handler(handler)
    }

    fn finish_handler(&self) -> Option<Arc<dyn FinishHandler>> {
        self.state().finish_handler()
    }

    fn set_finish_handler(&mut self, handler: Arc<dyn FinishHandler>) {
        self.state_mut().set_finish_handler(handler)
    }

    fn app(&self) -> Option<Arc<dyn Service>> {
        self.state().app()
    }

    fn set_app(&mut self, app: Arc<dyn Service>) {
        self.state_mut().set_app(app)
    }

    fn balance(&self) -> Option<Arc<dyn BalanceHandler>> {
        self.state().balance()
    }

    fn set_balance(&mut self, balance: Arc<dyn BalanceHandler>) {
        self.state_mut().set_balance(balance)
    }

    fn upstream_host(&self) -> Option<Arc<dyn UpstreamHostHandler>> {
        self.state().upstream_host()
    }

    fn set_upstream_host(&mut self, handler: Arc<dyn UpstreamHostHandler>) {
        self.state_mut().set_upstream_host(handler)
    }

    fn response_error(&self) -> Option<&ProxyError> {
        self.state().response_error()
    }

    /// Status of the upstream response currently held, if any.
    fn response_status(&self) -> Option<StatusCode> {
        self.state().response_status()
    }
}

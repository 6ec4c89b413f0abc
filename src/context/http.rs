//! HTTP request context.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Response};
use std::time::Duration;

use crate::context::client::{ClientFlavor, ProxyError};
use crate::context::state::ContextState;
use crate::context::{ContextError, ContextKind, EoContext};

/// Context for plain HTTP requests.
pub struct HttpContext {
    state: ContextState,
}

impl HttpContext {
    pub fn new(state: ContextState) -> Self {
        Self { state }
    }

    /// Add a header to the response the client receives.
    pub fn set_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.state.response_headers_mut().insert(name, value);
    }

    /// Query string of the inbound request, if any.
    pub fn query(&self) -> Option<&str> {
        self.state.request().uri().query()
    }

    /// Terminal write-back. Consuming `self` makes it the only exit.
    pub fn fast_finish(self) -> Response<Body> {
        let outcome = self
            .state
            .finish_handler()
            .and_then(|handler| handler.finish(&self));
        self.state.conclude(ContextKind::Http, outcome)
    }
}

#[async_trait]
impl EoContext for HttpContext {
    fn kind(&self) -> ContextKind {
        ContextKind::Http
    }

    fn state(&self) -> &ContextState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ContextState {
        &mut self.state
    }

    async fn send_to(&mut self, address: &str, timeout: Duration) -> Result<(), ProxyError> {
        self.state.send(ClientFlavor::Http, address, timeout).await
    }

    fn as_http(&mut self) -> Result<&mut HttpContext, ContextError> {
        Ok(self)
    }
}

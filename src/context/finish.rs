//! Finish and complete handlers.
//!
//! # Responsibilities
//! - `FinishHandler`: decides the terminal outcome a context serializes
//! - `CompleteHandler`: post-hoc accounting once the response body is gone
//! - Render outcomes as HTTP or trailers-only gRPC responses
//!
//! # Design Decisions
//! - A finish handler only returns an outcome; it never writes a response
//! - Complete handlers run when the response body is dropped by the connection

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, Response, StatusCode};
use hyper::body::{Frame, SizeHint};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::context::grpc::{trailers_only, GrpcCode};
use crate::context::request::FinishedRequest;
use crate::context::{ContextKind, EoContext};

/// Terminal outcome of a request, independent of the wire kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Status { status: StatusCode, body: String },
    Grpc { code: GrpcCode, message: String },
}

impl Outcome {
    pub fn status(status: StatusCode, body: impl Into<String>) -> Self {
        Outcome::Status {
            status,
            body: body.into(),
        }
    }

    pub fn grpc(code: GrpcCode, message: impl Into<String>) -> Self {
        Outcome::Grpc {
            code,
            message: message.into(),
        }
    }

    /// Render for the given context kind.
    pub fn render(self, kind: ContextKind) -> Response<Body> {
        match (kind, self) {
            (ContextKind::Http, Outcome::Status { status, body }) => text_response(status, body),
            (ContextKind::Http, Outcome::Grpc { code, message }) => {
                text_response(code.to_http(), message)
            }
            (ContextKind::Grpc, Outcome::Status { status, body }) => {
                trailers_only(GrpcCode::from_http(status), &body)
            }
            (ContextKind::Grpc, Outcome::Grpc { code, message }) => trailers_only(code, &message),
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Chooses the outcome the finish path serializes.
///
/// Returning `None` lets the upstream result (or the recorded proxy error)
/// stand.
pub trait FinishHandler: Send + Sync {
    fn finish(&self, ctx: &dyn EoContext) -> Option<Outcome>;
}

/// Default finish handler: defer to the proxy result.
#[derive(Debug, Default, Clone, Copy)]
pub struct Finisher;

impl FinishHandler for Finisher {
    fn finish(&self, _ctx: &dyn EoContext) -> Option<Outcome> {
        None
    }
}

/// Fixed failure outcome, used by the router and by rejecting chain links.
#[derive(Debug, Clone)]
pub struct ErrorFinisher {
    outcome: Outcome,
}

impl ErrorFinisher {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::status(status, message),
        }
    }

    pub fn grpc(code: GrpcCode, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::grpc(code, message),
        }
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }
}

impl FinishHandler for ErrorFinisher {
    fn finish(&self, _ctx: &dyn EoContext) -> Option<Outcome> {
        Some(self.outcome.clone())
    }
}

/// Runs after the response has been written. Must not affect the response.
pub trait CompleteHandler: Send + Sync {
    fn complete(&self, finished: &FinishedRequest);
}

/// Fan-out over several complete handlers, in order.
#[derive(Default, Clone)]
pub struct CompleteHandlers {
    handlers: Vec<Arc<dyn CompleteHandler>>,
}

impl CompleteHandlers {
    pub fn new(handlers: Vec<Arc<dyn CompleteHandler>>) -> Self {
        Self { handlers }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl CompleteHandler for CompleteHandlers {
    fn complete(&self, finished: &FinishedRequest) {
        for handler in &self.handlers {
            handler.complete(finished);
        }
    }
}

struct Completion {
    handler: Arc<dyn CompleteHandler>,
    finished: FinishedRequest,
    accepted: Instant,
}

/// Response body that fires the complete handler once it is dropped.
pub(crate) struct CompletionBody {
    inner: Body,
    completion: Option<Completion>,
}

impl CompletionBody {
    pub(crate) fn wrap(
        inner: Body,
        handler: Arc<dyn CompleteHandler>,
        finished: FinishedRequest,
        accepted: Instant,
    ) -> Body {
        Body::new(Self {
            inner,
            completion: Some(Completion {
                handler,
                finished,
                accepted,
            }),
        })
    }
}

impl hyper::body::Body for CompletionBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CompletionBody {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            let mut finished = completion.finished;
            finished.elapsed = completion.accepted.elapsed();
            completion.handler.complete(&finished);
        }
    }
}

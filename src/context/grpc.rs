//! gRPC request context.
//!
//! # Responsibilities
//! - `GrpcContext`: context kind chosen for `application/grpc` requests
//! - Status code mapping between gRPC and HTTP
//! - Trailers-only rendering of gateway-side outcomes

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use std::time::Duration;

use crate::context::client::{ClientFlavor, ProxyError};
use crate::context::state::ContextState;
use crate::context::{ContextKind, EoContext};

/// gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GrpcCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl GrpcCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// HTTP status to gRPC code, per the gRPC HTTP mapping table.
    pub fn from_http(status: StatusCode) -> Self {
        match status.as_u16() {
            200 => GrpcCode::Ok,
            400 => GrpcCode::Internal,
            401 => GrpcCode::Unauthenticated,
            403 => GrpcCode::PermissionDenied,
            404 => GrpcCode::Unimplemented,
            429 | 502 | 503 | 504 => GrpcCode::Unavailable,
            _ => GrpcCode::Unknown,
        }
    }

    /// Closest HTTP status for a gRPC code.
    pub fn to_http(self) -> StatusCode {
        match self {
            GrpcCode::Ok => StatusCode::OK,
            GrpcCode::InvalidArgument | GrpcCode::OutOfRange | GrpcCode::FailedPrecondition => {
                StatusCode::BAD_REQUEST
            }
            GrpcCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            GrpcCode::PermissionDenied => StatusCode::FORBIDDEN,
            GrpcCode::NotFound => StatusCode::NOT_FOUND,
            GrpcCode::AlreadyExists | GrpcCode::Aborted => StatusCode::CONFLICT,
            GrpcCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            GrpcCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            GrpcCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            GrpcCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            GrpcCode::Cancelled
            | GrpcCode::Unknown
            | GrpcCode::Internal
            | GrpcCode::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Code for a failed proxy call.
    pub fn from_proxy_error(error: &ProxyError) -> Self {
        if error.is_timeout() {
            GrpcCode::DeadlineExceeded
        } else {
            GrpcCode::Unavailable
        }
    }
}

/// Percent-encode a grpc-message value.
fn encode_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for byte in message.bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// HTTP 200 with status carried in headers and an empty body.
pub(crate) fn trailers_only(code: GrpcCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    headers.insert("grpc-status", HeaderValue::from(u16::from(code.as_u8())));
    if !message.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&encode_message(message)) {
            headers.insert("grpc-message", value);
        }
    }
    response
}

/// Context for gRPC calls. Outbound calls go over HTTP/2 only.
pub struct GrpcContext {
    state: ContextState,
}

impl GrpcContext {
    pub fn new(state: ContextState) -> Self {
        Self { state }
    }

    /// `(service, method)` from a `/package.Service/Method` path.
    pub fn service_method(&self) -> Option<(&str, &str)> {
        let path = self.state.request().path().strip_prefix('/')?;
        let (service, method) = path.split_once('/')?;
        if service.is_empty() || method.is_empty() || method.contains('/') {
            return None;
        }
        Some((service, method))
    }

    /// A request metadata entry. Binary (`-bin`) entries are returned raw.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.state.request().header(key)
    }

    /// Deadline the client asked for via `grpc-timeout`.
    pub fn client_timeout(&self) -> Option<Duration> {
        parse_grpc_timeout(self.state.request().header("grpc-timeout")?)
    }

    /// Terminal write-back. Consuming `self` makes it the only exit.
    pub fn fast_finish(self) -> Response<Body> {
        let outcome = self
            .state
            .finish_handler()
            .and_then(|handler| handler.finish(&self));
        self.state.conclude(ContextKind::Grpc, outcome)
    }
}

/// Parses a `grpc-timeout` value. Anything malformed or out of range is
/// treated as no deadline.
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: u64 = amount.parse().ok()?;
    Some(match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    })
}

#[async_trait]
impl EoContext for GrpcContext {
    fn kind(&self) -> ContextKind {
        ContextKind::Grpc
    }

    fn state(&self) -> &ContextState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ContextState {
        &mut self.state
    }

    async fn send_to(&mut self, address: &str, timeout: Duration) -> Result<(), ProxyError> {
        self.state.send(ClientFlavor::Grpc, address, timeout).await
    }

    fn as_grpc(&mut self) -> Result<&mut GrpcContext, crate::context::ContextError> {
        Ok(self)
    }
}

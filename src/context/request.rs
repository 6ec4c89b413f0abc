//! Request views carried by a context.
//!
//! # Responsibilities
//! - `RequestReader`: immutable view of the inbound request
//! - `ProxyRequest`: mutable copy that chain links edit before proxying
//! - `ProxyRecord`: one entry per outbound attempt
//! - `FinishedRequest`: summary handed to complete handlers
//!
//! # Design Decisions
//! - Bodies are buffered once so retries can resend them
//! - Hop-by-hop headers never cross the proxy in either direction

use axum::body::Body;
use axum::http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method, Request, Uri, Version,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use crate::context::client::ProxyError;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "trailer",
    "proxy-authenticate",
];

/// Removes hop-by-hop headers. `te: trailers` survives since gRPC needs it.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    let te_is_trailers = headers
        .get(header::TE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("trailers"))
        .unwrap_or(true);
    if !te_is_trailers {
        headers.remove(header::TE);
    }
}

/// Immutable view of the inbound request.
#[derive(Debug, Clone)]
pub struct RequestReader {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: SocketAddr,
    secure: bool,
}

impl RequestReader {
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
        secure: bool,
    ) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
            body,
            remote_addr,
            secure,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// `https` when the connection was TLS-terminated here.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Host the client asked for: the Host header, else the URI authority.
    pub fn host(&self) -> &str {
        self.header("host")
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
            .unwrap_or("")
    }

    /// Host without a port suffix, for matching.
    pub fn host_name(&self) -> &str {
        let host = self.host();
        if host.starts_with('[') {
            // IPv6 literal
            return host.split(']').next().map(|h| &h[1..]).unwrap_or(host);
        }
        host.split(':').next().unwrap_or(host)
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Client IP honoring `X-Real-IP` then the first `X-Forwarded-For` hop.
    pub fn real_ip(&self) -> String {
        if let Some(ip) = self.header(X_REAL_IP).map(str::trim).filter(|v| !v.is_empty()) {
            return ip.to_string();
        }
        if let Some(first) = self
            .header(X_FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return first.to_string();
        }
        self.remote_addr.ip().to_string()
    }

    pub fn is_grpc(&self) -> bool {
        self.header("content-type")
            .map(|ct| ct.starts_with("application/grpc"))
            .unwrap_or(false)
    }
}

/// The outbound request as chain links have shaped it.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body: Bytes,
    forwarded_for: String,
}

impl ProxyRequest {
    pub fn from_reader(reader: &RequestReader) -> Self {
        let mut headers = reader.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        let forwarded_for = match reader.header(X_FORWARDED_FOR) {
            Some(prior) => format!("{}, {}", prior, reader.remote_addr().ip()),
            None => reader.remote_addr().ip().to_string(),
        };

        Self {
            method: reader.method().clone(),
            path_and_query: reader
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            headers,
            body: reader.body().clone(),
            forwarded_for,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    pub fn set_path_and_query(&mut self, path_and_query: impl Into<String>) {
        self.path_and_query = path_and_query.into();
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    /// Build the outbound request for one attempt.
    pub(crate) fn build(
        &self,
        scheme: &str,
        authority: &str,
        host_header: &str,
        request_id: &str,
        version: Option<Version>,
    ) -> Result<Request<Body>, ProxyError> {
        let invalid = |reason: String| ProxyError::InvalidAddress {
            address: format!("{}://{}", scheme, authority),
            reason,
        };

        let uri = Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(self.path_and_query.as_str())
            .build()
            .map_err(|e| invalid(e.to_string()))?;

        let mut request = Request::new(Body::from(self.body.clone()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        if let Some(version) = version {
            *request.version_mut() = version;
        }

        let headers = request.headers_mut();
        for (name, value) in self.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
        if !host_header.is_empty() {
            let value = HeaderValue::from_str(host_header).map_err(|e| invalid(e.to_string()))?;
            headers.insert(header::HOST, value);
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        Ok(request)
    }
}

/// One outbound attempt made while serving a request.
#[derive(Debug, Clone)]
pub struct ProxyRecord {
    pub scheme: String,
    pub target: String,
    pub host_header: String,
    pub uri: String,
    pub started_at: Instant,
    pub elapsed: Option<Duration>,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl ProxyRecord {
    pub(crate) fn start(scheme: &str, target: &str, host_header: &str, uri: String) -> Self {
        Self {
            scheme: scheme.to_string(),
            target: target.to_string(),
            host_header: host_header.to_string(),
            uri,
            started_at: Instant::now(),
            elapsed: None,
            status: None,
            error: None,
        }
    }

    pub(crate) fn succeed(&mut self, status: u16) {
        self.elapsed = Some(self.started_at.elapsed());
        self.status = Some(status);
    }

    pub(crate) fn fail(&mut self, error: &ProxyError) {
        self.elapsed = Some(self.started_at.elapsed());
        self.error = Some(error.to_string());
    }
}

/// What a complete handler sees once a request is over.
#[derive(Debug, Clone)]
pub struct FinishedRequest {
    pub request_id: String,
    pub kind: crate::context::ContextKind,
    pub port: u16,
    pub method: String,
    pub uri: String,
    pub host: String,
    pub client_ip: String,
    pub status: u16,
    pub grpc_status: Option<String>,
    pub labels: HashMap<String, String>,
    pub proxies: Vec<ProxyRecord>,
    pub request_bytes: usize,
    pub accepted_at: SystemTime,
    pub elapsed: Duration,
    pub error: Option<String>,
}

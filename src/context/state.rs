//! State shared by every context kind.
//!
//! # Responsibilities
//! - Immutable identity: request id, acceptance time, local port
//! - Mutable routing state: labels, installed handlers, proxy history
//! - The outbound call behind `send_to`
//! - Concluding the request into a single response

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Version};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::context::client::{ClientFlavor, ProxyError, UpstreamClient};
use crate::context::finish::{CompleteHandler, CompletionBody, FinishHandler, Outcome};
use crate::context::grpc::GrpcCode;
use crate::context::host::{outbound_host, read_address, PassHost, UpstreamHostHandler};
use crate::context::request::{
    strip_hop_by_hop, FinishedRequest, ProxyRecord, ProxyRequest, RequestReader,
};
use crate::context::{ContextKind, LABEL_API_ID};
use crate::observability::metrics;
use crate::upstream::{BalanceHandler, Service};

/// Body of the 502 sent when nothing produced a response.
pub const NO_UPSTREAM_RESPONSE: &str = "no upstream response";

pub struct ContextState {
    request_id: String,
    accepted: Instant,
    accepted_at: SystemTime,
    port: u16,
    reader: RequestReader,
    proxy: ProxyRequest,
    proxies: Vec<ProxyRecord>,
    labels: HashMap<String, String>,
    response_headers: HeaderMap,
    complete: Option<Arc<dyn CompleteHandler>>,
    finish: Option<Arc<dyn FinishHandler>>,
    app: Option<Arc<dyn Service>>,
    balance: Option<Arc<dyn BalanceHandler>>,
    upstream_host: Option<Arc<dyn UpstreamHostHandler>>,
    response: Option<Response<Body>>,
    response_error: Option<ProxyError>,
    client: Arc<UpstreamClient>,
}

impl ContextState {
    /// Fresh state with a new request id and acceptance time.
    pub fn new(port: u16, reader: RequestReader, client: Arc<UpstreamClient>) -> Self {
        let proxy = ProxyRequest::from_reader(&reader);
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            accepted: Instant::now(),
            accepted_at: SystemTime::now(),
            port,
            reader,
            proxy,
            proxies: Vec::new(),
            labels: HashMap::new(),
            response_headers: HeaderMap::new(),
            complete: None,
            finish: None,
            app: None,
            balance: None,
            upstream_host: None,
            response: None,
            response_error: None,
            client,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn accepted_at(&self) -> SystemTime {
        self.accepted_at
    }

    pub fn elapsed(&self) -> Duration {
        self.accepted.elapsed()
    }

    pub fn request(&self) -> &RequestReader {
        &self.reader
    }

    pub fn proxy(&self) -> &ProxyRequest {
        &self.proxy
    }

    pub fn proxy_mut(&mut self) -> &mut ProxyRequest {
        &mut self.proxy
    }

    pub fn proxies(&self) -> &[ProxyRecord] {
        &self.proxies
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response_headers
    }

    pub fn complete_handler(&self) -> Option<Arc<dyn CompleteHandler>> {
        self.complete.clone()
    }

    pub fn set_complete_handler(&mut self, handler: Arc<dyn CompleteHandler>) {
        self.complete = Some(handler);
    }

    pub fn finish_handler(&self) -> Option<Arc<dyn FinishHandler>> {
        self.finish.clone()
    }

    pub fn set_finish_handler(&mut self, handler: Arc<dyn FinishHandler>) {
        self.finish = Some(handler);
    }

    pub fn app(&self) -> Option<Arc<dyn Service>> {
        self.app.clone()
    }

    pub fn set_app(&mut self, app: Arc<dyn Service>) {
        self.app = Some(app);
    }

    pub fn balance(&self) -> Option<Arc<dyn BalanceHandler>> {
        self.balance.clone()
    }

    pub fn set_balance(&mut self, balance: Arc<dyn BalanceHandler>) {
        self.balance = Some(balance);
    }

    pub fn upstream_host(&self) -> Option<Arc<dyn UpstreamHostHandler>> {
        self.upstream_host.clone()
    }

    pub fn set_upstream_host(&mut self, handler: Arc<dyn UpstreamHostHandler>) {
        self.upstream_host = Some(handler);
    }

    pub fn response_error(&self) -> Option<&ProxyError> {
        self.response_error.as_ref()
    }

    pub fn response_status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|r| r.status())
    }

    /// One outbound attempt. Never retries.
    pub(crate) async fn send(
        &mut self,
        flavor: ClientFlavor,
        address: &str,
        timeout: Duration,
    ) -> Result<(), ProxyError> {
        let (scheme, target) = read_address(address);
        let (policy, rewrite) = match &self.upstream_host {
            Some(handler) => {
                let (policy, rewrite) = handler.pass_host();
                (policy, rewrite.to_string())
            }
            None => (PassHost::Pass, String::new()),
        };
        let host_header = outbound_host(policy, self.reader.host(), target, &rewrite).to_string();

        self.proxies.push(ProxyRecord::start(
            &scheme,
            target,
            &host_header,
            format!("{}://{}{}", scheme, target, self.proxy.path_and_query()),
        ));

        let prepared = self.prepare(flavor, &scheme, target, &host_header);
        let client = Arc::clone(&self.client);
        let result = match prepared {
            Ok(request) => client.send(flavor, request, timeout).await,
            Err(error) => Err(error),
        };

        // The record pushed above is always the last one.
        let record = self.proxies.last_mut();
        match result {
            Ok(response) => {
                if let Some(record) = record {
                    record.succeed(response.status().as_u16());
                }
                tracing::debug!(
                    request_id = %self.request_id,
                    target = %address,
                    host = %host_header,
                    status = %response.status(),
                    "Upstream responded"
                );
                self.response = Some(response);
                self.response_error = None;
                Ok(())
            }
            Err(error) => {
                if let Some(record) = record {
                    record.fail(&error);
                }
                tracing::warn!(
                    request_id = %self.request_id,
                    target = %address,
                    kind = error.kind(),
                    error = %error,
                    "Upstream call failed"
                );
                metrics::record_proxy_error(error.kind());
                self.response = None;
                self.response_error = Some(error.clone());
                Err(error)
            }
        }
    }

    fn prepare(
        &self,
        flavor: ClientFlavor,
        scheme: &str,
        target: &str,
        host_header: &str,
    ) -> Result<Request<Body>, ProxyError> {
        if scheme != "http" && scheme != "https" {
            return Err(ProxyError::InvalidAddress {
                address: format!("{}://{}", scheme, target),
                reason: "unsupported scheme".to_string(),
            });
        }
        let version = match flavor {
            ClientFlavor::Grpc => Some(Version::HTTP_2),
            ClientFlavor::Http => None,
        };
        self.proxy
            .build(scheme, target, host_header, &self.request_id, version)
    }

    /// Turn the state into the response for the client.
    ///
    /// Precedence: an explicit outcome, then the recorded proxy error, then
    /// the upstream response, then a 502.
    pub(crate) fn conclude(mut self, kind: ContextKind, outcome: Option<Outcome>) -> Response<Body> {
        let mut error_text = None;
        let mut response = match outcome {
            Some(outcome) => outcome.render(kind),
            None => match self.response_error.take() {
                Some(error) => {
                    let text = error.to_string();
                    error_text = Some(text.clone());
                    match kind {
                        ContextKind::Http => {
                            Outcome::status(StatusCode::GATEWAY_TIMEOUT, text).render(kind)
                        }
                        ContextKind::Grpc => {
                            Outcome::grpc(GrpcCode::from_proxy_error(&error), text).render(kind)
                        }
                    }
                }
                None => match self.response.take() {
                    Some(mut upstream) => {
                        strip_hop_by_hop(upstream.headers_mut());
                        upstream
                    }
                    None => Outcome::status(StatusCode::BAD_GATEWAY, NO_UPSTREAM_RESPONSE)
                        .render(kind),
                },
            },
        };

        let headers = response.headers_mut();
        for (name, value) in self.response_headers.drain() {
            if let Some(name) = name {
                headers.insert(name, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            headers.insert("x-request-id", value);
        }

        let status = response.status();
        let grpc_status = response
            .headers()
            .get("grpc-status")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let route = self.label(LABEL_API_ID).unwrap_or("none").to_string();
        metrics::record_request(self.port, &route, status.as_u16(), self.accepted);

        let Some(handler) = self.complete.take() else {
            return response;
        };

        let finished = FinishedRequest {
            request_id: self.request_id,
            kind,
            port: self.port,
            method: self.reader.method().to_string(),
            uri: self.reader.uri().to_string(),
            host: self.reader.host().to_string(),
            client_ip: self.reader.real_ip(),
            status: status.as_u16(),
            grpc_status,
            labels: self.labels,
            proxies: self.proxies,
            request_bytes: self.reader.body().len(),
            accepted_at: self.accepted_at,
            elapsed: self.accepted.elapsed(),
            error: error_text,
        };
        let (parts, body) = response.into_parts();
        Response::from_parts(
            parts,
            CompletionBody::wrap(body, handler, finished, self.accepted),
        )
    }
}

//! Outbound HTTP client shared by every context.
//!
//! # Responsibilities
//! - Pooled connections to `http://` and `https://` upstreams
//! - A dedicated HTTP/2-only pool for gRPC contexts
//! - Bound each call by its timeout and classify failures
//!
//! # Design Decisions
//! - The timeout covers connect plus response headers; the body streams afterwards
//! - Connect failures are reported apart from protocol failures

use axum::body::Body;
use axum::http::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single outbound call.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("upstream {address} did not respond within {}ms", timeout.as_millis())]
    Timeout { address: String, timeout: Duration },

    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("upstream {address} failed: {reason}")]
    Protocol { address: String, reason: String },

    #[error("invalid upstream address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

impl ProxyError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Timeout { .. } => "timeout",
            ProxyError::Connect { .. } => "connect",
            ProxyError::Protocol { .. } => "protocol",
            ProxyError::InvalidAddress { .. } => "invalid_address",
        }
    }

    /// True for timeouts and connection failures; false for protocol-level errors.
    pub fn is_network(&self) -> bool {
        matches!(self, ProxyError::Timeout { .. } | ProxyError::Connect { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout { .. })
    }
}

/// Which connection pool a call goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFlavor {
    Http,
    Grpc,
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Pooled upstream client.
#[derive(Clone)]
pub struct UpstreamClient {
    http: HttpsClient,
    grpc: HttpsClient,
}

impl UpstreamClient {
    /// Build both pools with the webpki root store.
    pub fn new() -> Result<Self, rustls::Error> {
        let http_connector = HttpsConnectorBuilder::new()
            .with_tls_config(client_tls_config()?)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let grpc_connector = HttpsConnectorBuilder::new()
            .with_tls_config(client_tls_config()?)
            .https_or_http()
            .enable_http2()
            .build();

        Ok(Self {
            http: Client::builder(TokioExecutor::new()).build(http_connector),
            grpc: Client::builder(TokioExecutor::new())
                .http2_only(true)
                .build(grpc_connector),
        })
    }

    /// Send one request, bounded by `timeout`.
    pub async fn send(
        &self,
        flavor: ClientFlavor,
        request: Request<Body>,
        timeout: Duration,
    ) -> Result<Response<Body>, ProxyError> {
        let address = request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let client = match flavor {
            ClientFlavor::Http => &self.http,
            ClientFlavor::Grpc => &self.grpc,
        };

        match tokio::time::timeout(timeout, client.request(request)).await {
            Err(_) => Err(ProxyError::Timeout { address, timeout }),
            Ok(Err(e)) if e.is_connect() => Err(ProxyError::Connect {
                address,
                reason: error_chain(&e),
            }),
            Ok(Err(e)) => Err(ProxyError::Protocol {
                address,
                reason: error_chain(&e),
            }),
            Ok(Ok(response)) => Ok(response.map(Body::new)),
        }
    }
}

fn client_tls_config() -> Result<rustls::ClientConfig, rustls::Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Ok(rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth())
}

/// Flatten an error and its sources into one line.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = UpstreamClient::new().unwrap();
        let request = Request::builder()
            .uri(format!("http://127.0.0.1:{}/", port))
            .body(Body::empty())
            .unwrap();

        let err = client
            .send(ClientFlavor::Http, request, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connect");
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the socket without answering.
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = UpstreamClient::new().unwrap();
        let request = Request::builder()
            .uri(format!("http://{}/slow", addr))
            .body(Body::empty())
            .unwrap();

        let started = std::time::Instant::now();
        let err = client
            .send(ClientFlavor::Http, request, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(err.to_string().contains("200ms"));
    }
}

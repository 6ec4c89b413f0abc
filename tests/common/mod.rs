//! Shared utilities for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::header;
use axum::Json;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use edge_gateway::chain::{ChainError, Filter, Next};
use edge_gateway::config::{parse_config, GatewayConfig};
use edge_gateway::context::{EoContext, PassHost, UpstreamHostHandler};
use edge_gateway::router::{Protocol, RouteRules, RouteSpec};
use edge_gateway::upstream::{BalanceError, BalanceHandler, Node, Service};
use edge_gateway::Gateway;

/// Distinct free ports on loopback.
pub fn free_ports<const N: usize>() -> [u16; N] {
    let held: Vec<_> = (0..N)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    std::array::from_fn(|i| held[i].local_addr().unwrap().port())
}

/// Backend that answers every request with what it received.
pub async fn start_echo_backend() -> SocketAddr {
    start_counting_echo_backend().await.0
}

/// Echo backend plus the number of requests it has served.
pub async fn start_counting_echo_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let app = Router::new().fallback(move |request: Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { echo(request) }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, served)
}

fn echo(request: Request) -> Json<serde_json::Value> {
    let get = |name: header::HeaderName| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    Json(serde_json::json!({
        "method": request.method().as_str(),
        "path": request.uri().path(),
        "host": get(header::HOST),
        "x_forwarded_for": get(header::HeaderName::from_static("x-forwarded-for")),
        "x_request_id": get(header::HeaderName::from_static("x-request-id")),
        "x_api_key": get(header::HeaderName::from_static("x-api-key")),
    }))
}

/// Backend that accepts connections and never answers.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Parse `raw` and apply it to a fresh gateway bound on loopback.
pub async fn start_gateway(raw: &str) -> (Arc<Gateway>, GatewayConfig) {
    let config = parse_config(raw).unwrap();
    let gateway = Arc::new(Gateway::new(&config).unwrap());
    gateway.apply(&config).await.unwrap();
    (gateway, config)
}

/// Self-signed certificate for `hosts`, as (cert pem, key pem, der).
pub fn self_signed(hosts: &[&str]) -> (String, String, rustls::pki_types::CertificateDer<'static>) {
    let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names).unwrap();
    (
        certified.cert.pem(),
        certified.key_pair.serialize_pem(),
        certified.cert.der().clone(),
    )
}

/// Service that goes nowhere; for lifecycle tests that never dispatch.
pub struct NullService;

#[async_trait]
impl Filter for NullService {
    async fn do_filter(&self, _ctx: &mut dyn EoContext, _next: Next<'_>) -> Result<(), ChainError> {
        Ok(())
    }
}

impl BalanceHandler for NullService {
    fn select(&self, _ctx: &dyn EoContext) -> Result<Arc<Node>, BalanceError> {
        Err(BalanceError::NoNodes("null".into()))
    }

    fn scheme(&self) -> &str {
        "http"
    }

    fn down_period(&self) -> Duration {
        Duration::ZERO
    }
}

impl UpstreamHostHandler for NullService {
    fn pass_host(&self) -> (PassHost, &str) {
        (PassHost::Pass, "")
    }
}

impl Service for NullService {
    fn id(&self) -> &str {
        "null"
    }

    fn name(&self) -> &str {
        "null"
    }

    fn balance(&self) -> Arc<dyn BalanceHandler> {
        Arc::new(NullService)
    }

    fn upstream_host(&self) -> Arc<dyn UpstreamHostHandler> {
        Arc::new(NullService)
    }

    fn handler(&self) -> Arc<dyn Filter> {
        Arc::new(NullService)
    }
}

pub fn null_route(id: &str) -> RouteSpec {
    RouteSpec {
        id: id.to_string(),
        name: id.to_string(),
        protocol: Protocol::Http,
        certificates: HashMap::new(),
        disabled: false,
        rules: RouteRules::default(),
        service: Arc::new(NullService),
        filters: Vec::new(),
        outputs: Vec::new(),
    }
}

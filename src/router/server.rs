//! One listener and its HTTP/gRPC server.
//!
//! # Responsibilities
//! - Bind the port and optionally terminate TLS (SNI via `SniResolver`)
//! - Accept connections under the per-port cap
//! - Serve HTTP/1.1 and HTTP/2 through a per-port axum router
//! - Dispatch each request into a context and the route table
//! - Stop accepting, release the listener, then drain on close
//!
//! # Data Flow
//! ```text
//! accept loop (one task per port)
//!     → TLS handshake (bounded by handshake timeout)
//!     → connection task (hyper-util auto builder)
//!         → axum Router (TraceLayer)
//!             → dispatch: buffer body → context → table.find → route.serve
//!             → fast_finish (the only response path)
//! ```
//!
//! # Design Decisions
//! - The request ceiling is enforced inside dispatch, so an expired request
//!   still leaves through `fast_finish` with its request id and outputs

use axum::body::Bytes;
use axum::extract::{Extension, Request, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::chain::ChainError;
use crate::context::{
    ContextState, EoContext, ErrorFinisher, GrpcCode, GrpcContext, HttpContext, RequestReader,
    UpstreamClient,
};
use crate::net::{tls, Certs, ConnectionTracker, Listener, ListenerError, SniResolver, TlsError};
use crate::observability::metrics;
use crate::router::manager::ManagerError;
use crate::router::route::Protocol;
use crate::router::table::RouteTable;
use crate::router::{BODY_TOO_LARGE, REQUEST_TIMED_OUT, ROUTE_NOT_FOUND};

/// Limits and timeouts shared by every port server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub max_connections: usize,
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            max_connections: 10_000,
            max_body_bytes: 4 * 1024 * 1024,
            request_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Connection facts handed to dispatch as a request extension.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub remote: SocketAddr,
    pub secure: bool,
}

#[derive(Clone)]
struct PortState {
    port: u16,
    table: Arc<RouteTable>,
    client: Arc<UpstreamClient>,
    max_body_bytes: usize,
    request_timeout: Duration,
}

/// Why a request is answered before routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Ready,
    TooLarge,
    TimedOut,
}

/// A running server for one port.
pub struct HttpServer {
    port: u16,
    protocol: Protocol,
    local_addr: SocketAddr,
    resolver: Option<Arc<SniResolver>>,
    shutdown: watch::Sender<bool>,
    tracker: ConnectionTracker,
    accept_task: JoinHandle<()>,
    drain_timeout: Duration,
}

impl HttpServer {
    /// Bind the table's port and start accepting in a background task.
    ///
    /// Binding is the last fallible step, so an error leaves nothing behind.
    pub fn start(
        table: Arc<RouteTable>,
        protocol: Protocol,
        certs: Option<Certs>,
        settings: &ServerSettings,
        client: Arc<UpstreamClient>,
    ) -> Result<Self, ManagerError> {
        let port = table.port();

        let (resolver, acceptor) = match protocol {
            Protocol::Https => {
                let certs = certs.ok_or(TlsError::NoCertificates)?;
                let resolver = Arc::new(SniResolver::new(port, certs));
                let acceptor = tls::acceptor(Arc::clone(&resolver))?;
                (Some(resolver), Some(acceptor))
            }
            Protocol::Http => (None, None),
        };

        let listener = Listener::bind(&settings.host, port, settings.max_connections)?;
        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            addr: format!("{}:{}", settings.host, port),
            source,
        })?;

        let state = PortState {
            port,
            table,
            client,
            max_body_bytes: settings.max_body_bytes,
            request_timeout: settings.request_timeout,
        };
        let router = build_router(state);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tracker = ConnectionTracker::new();
        let accept_task = tokio::spawn(accept_loop(AcceptLoop {
            port,
            listener,
            acceptor,
            router,
            shutdown: shutdown_rx,
            tracker: tracker.clone(),
            handshake_timeout: settings.handshake_timeout,
        }));

        tracing::info!(port, address = %local_addr, protocol = %protocol, "Server started");

        Ok(Self {
            port,
            protocol,
            local_addr,
            resolver,
            shutdown,
            tracker,
            accept_task,
            drain_timeout: settings.drain_timeout,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Hosts served by the current certificate store.
    pub fn certificate_hosts(&self) -> Vec<String> {
        self.resolver
            .as_ref()
            .map(|r| r.current().hosts())
            .unwrap_or_default()
    }

    /// Atomically replace the certificate store. No-op for plain HTTP.
    pub fn swap_certs(&self, certs: Certs) {
        if let Some(resolver) = &self.resolver {
            resolver.swap(certs);
        }
    }

    /// Stop accepting and wait for the listener to be released.
    ///
    /// Open connections are told to finish; the returned `Draining` waits for them.
    pub async fn close(self) -> Draining {
        self.shutdown.send_replace(true);
        if let Err(e) = self.accept_task.await {
            tracing::warn!(port = self.port, error = %e, "Accept task ended abnormally");
        }
        tracing::info!(port = self.port, "Listener released");

        Draining {
            port: self.port,
            tracker: self.tracker,
            timeout: self.drain_timeout,
            _shutdown: self.shutdown,
        }
    }
}

/// In-flight connections of a closed server.
pub struct Draining {
    port: u16,
    tracker: ConnectionTracker,
    timeout: Duration,
    _shutdown: watch::Sender<bool>,
}

impl Draining {
    /// Wait for connections to finish, bounded by the drain timeout.
    /// Returns true when every connection closed in time.
    pub async fn wait(self) -> bool {
        let idle = self.tracker.wait_idle(self.timeout).await;
        if idle {
            tracing::info!(port = self.port, "Server stopped");
        } else {
            tracing::warn!(
                port = self.port,
                remaining = self.tracker.active_count(),
                timeout_secs = self.timeout.as_secs(),
                "Drain timed out with connections still open"
            );
        }
        idle
    }
}

fn build_router(state: PortState) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

struct AcceptLoop {
    port: u16,
    listener: Listener,
    acceptor: Option<TlsAcceptor>,
    router: Router,
    shutdown: watch::Receiver<bool>,
    tracker: ConnectionTracker,
    handshake_timeout: Duration,
}

/// Resolves once stop is signalled. A dropped sender also counts as stop.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn accept_loop(mut ctx: AcceptLoop) {
    loop {
        let accepted = tokio::select! {
            _ = stopped(&mut ctx.shutdown) => break,
            accepted = ctx.listener.accept() => accepted,
        };

        let (stream, remote, permit) = match accepted {
            Ok(accepted) => accepted,
            Err(ListenerError::Closed) => break,
            Err(e) => {
                tracing::warn!(port = ctx.port, error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        let guard = ctx.tracker.track();
        let acceptor = ctx.acceptor.clone();
        let router = ctx.router.clone();
        let shutdown = ctx.shutdown.clone();
        let handshake_timeout = ctx.handshake_timeout;
        let port = ctx.port;

        tokio::spawn(async move {
            let _permit = permit;
            let connection_id = guard.id();
            match acceptor {
                None => serve_connection(TokioIo::new(stream), remote, false, router, shutdown).await,
                Some(acceptor) => {
                    match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                        Ok(Ok(tls)) => {
                            serve_connection(TokioIo::new(tls), remote, true, router, shutdown).await
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(port, %connection_id, peer = %remote, error = %e, "TLS handshake failed");
                            metrics::record_tls_handshake_failure("handshake");
                        }
                        Err(_) => {
                            tracing::debug!(port, %connection_id, peer = %remote, "TLS handshake timed out");
                            metrics::record_tls_handshake_failure("timeout");
                        }
                    }
                }
            }
            drop(guard);
        });
    }

    // Dropping the listener here releases the port.
    drop(ctx.listener);
}

async fn serve_connection<I>(
    io: TokioIo<I>,
    remote: SocketAddr,
    secure: bool,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let info = ConnectionInfo { remote, secure };
    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(info);
        router.clone().oneshot(request)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(io, service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = stopped(&mut shutdown) => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };

    if let Err(e) = result {
        tracing::debug!(peer = %remote, error = %e, "Connection closed with error");
    }
}

async fn dispatch(
    State(state): State<PortState>,
    Extension(conn): Extension<ConnectionInfo>,
    request: Request,
) -> Response {
    let deadline = Instant::now() + state.request_timeout;
    let (parts, body) = request.into_parts();

    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    let (body, admission) = if declared.is_some_and(|len| len > state.max_body_bytes) {
        (Bytes::new(), Admission::TooLarge)
    } else {
        let buffered = axum::body::to_bytes(body, state.max_body_bytes);
        match tokio::time::timeout_at(deadline, buffered).await {
            Ok(Ok(bytes)) => (bytes, Admission::Ready),
            Ok(Err(e)) => {
                tracing::debug!(port = state.port, error = %e, "Request body not buffered");
                (Bytes::new(), Admission::TooLarge)
            }
            Err(_) => (Bytes::new(), Admission::TimedOut),
        }
    };

    let reader = RequestReader::new(
        parts.method,
        parts.uri,
        parts.version,
        parts.headers,
        body,
        conn.remote,
        conn.secure,
    );
    let grpc = reader.is_grpc();
    let context = ContextState::new(state.port, reader, Arc::clone(&state.client));

    if grpc {
        let mut ctx = GrpcContext::new(context);
        drive_until(&state, &mut ctx, admission, deadline).await;
        ctx.fast_finish()
    } else {
        let mut ctx = HttpContext::new(context);
        drive_until(&state, &mut ctx, admission, deadline).await;
        ctx.fast_finish()
    }
}

/// `drive` bounded by the request deadline. On expiry the in-flight chain is
/// dropped and the context finishes with a deadline outcome (504, or
/// `DEADLINE_EXCEEDED` for gRPC).
async fn drive_until(
    state: &PortState,
    ctx: &mut dyn EoContext,
    admission: Admission,
    deadline: Instant,
) {
    let expired = match admission {
        Admission::TimedOut => true,
        _ => tokio::time::timeout_at(deadline, drive(state, &mut *ctx, admission))
            .await
            .is_err(),
    };
    if expired {
        tracing::warn!(
            port = state.port,
            request_id = %ctx.request_id(),
            timeout_ms = state.request_timeout.as_millis() as u64,
            "Request deadline exceeded"
        );
        ctx.set_finish_handler(Arc::new(ErrorFinisher::grpc(
            GrpcCode::DeadlineExceeded,
            REQUEST_TIMED_OUT,
        )));
    }
}

/// Everything between context creation and `fast_finish`.
async fn drive(state: &PortState, ctx: &mut dyn EoContext, admission: Admission) {
    if admission == Admission::TooLarge {
        tracing::warn!(
            port = state.port,
            request_id = %ctx.request_id(),
            limit = state.max_body_bytes,
            "Request body too large"
        );
        ctx.set_finish_handler(Arc::new(ErrorFinisher::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            BODY_TOO_LARGE,
        )));
        return;
    }

    let Some(route) = state.table.find(ctx.request()) else {
        tracing::warn!(
            port = state.port,
            request_id = %ctx.request_id(),
            host = %ctx.request().host(),
            path = %ctx.request().path(),
            "No route matched"
        );
        ctx.set_finish_handler(Arc::new(ErrorFinisher::new(StatusCode::NOT_FOUND, ROUTE_NOT_FOUND)));
        return;
    };

    if let Err(e) = route.serve(ctx).await {
        match e {
            ChainError::Rejected { .. } => {
                tracing::debug!(port = state.port, request_id = %ctx.request_id(), route_id = %route.id(), error = %e, "Request rejected")
            }
            _ => {
                tracing::warn!(port = state.port, request_id = %ctx.request_id(), route_id = %route.id(), error = %e, "Chain failed")
            }
        }
    }
}

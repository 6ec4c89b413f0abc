//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind a port synchronously so bind errors surface to the caller
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),

    #[error("listener closed")]
    Closed,
}

/// A bounded TCP listener that limits concurrent connections.
///
/// When the limit is reached, accepting waits until a slot frees up.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind `host:port`. Must run inside a Tokio runtime.
    pub fn bind(host: &str, port: u16, max_connections: usize) -> Result<Self, ListenerError> {
        let addr = format!("{}:{}", host, port);
        let bind_error = |source| ListenerError::Bind {
            addr: addr.clone(),
            source,
        };

        let std_listener = std::net::TcpListener::bind(addr.as_str()).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let inner = TcpListener::from_std(std_listener).map_err(bind_error)?;

        let local_addr = inner.local_addr().map_err(bind_error)?;
        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections.max(1))),
            max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Permit first, then accept.
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A connection slot. Dropping it frees the slot, even if the handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

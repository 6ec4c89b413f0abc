//! Port server lifecycle.
//!
//! # Responsibilities
//! - Own one server per port with at least one route
//! - Create the server on the first route, tear it down after the last
//! - Rebuild and swap certificate stores as https routes change
//! - Stop every server exactly once on `cancel`
//!
//! # Design Decisions
//! - One async mutex covers the port map, so a route count change and the
//!   matching server creation or teardown are a single step
//! - Binding is a non-blocking syscall and happens under the lock; accepting
//!   runs in a background task
//! - Teardown releases the listener under the lock and drains outside it, so a
//!   slow drain never stalls other ports
//! - A failed add leaves the map untouched

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::context::UpstreamClient;
use crate::net::{CertificateConfig, Certs, ListenerError, TlsError};
use crate::observability::metrics;
use crate::router::route::{Protocol, Route, RouteError, RouteSpec};
use crate::router::server::{Draining, HttpServer, ServerSettings};
use crate::router::table::RouteTable;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("port {port} serves {live}; route {route_id} asks for {requested}")]
    ProtocolMismatch {
        port: u16,
        route_id: String,
        live: Protocol,
        requested: Protocol,
    },

    #[error("manager is shut down")]
    Closed,
}

struct PortServer {
    table: Arc<RouteTable>,
    server: HttpServer,
}

/// Snapshot of one live port.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PortStatus {
    pub port: u16,
    pub protocol: Protocol,
    pub routes: Vec<String>,
    pub active_connections: u64,
    pub certificate_hosts: Vec<String>,
}

pub struct Manager {
    settings: ServerSettings,
    client: Arc<UpstreamClient>,
    servers: Mutex<HashMap<u16, PortServer>>,
    cancelled: AtomicBool,
}

impl Manager {
    pub fn new(settings: ServerSettings, client: Arc<UpstreamClient>) -> Self {
        Self {
            settings,
            client,
            servers: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Upsert a route on `port`, starting the port's server if it had none.
    pub async fn add(&self, port: u16, spec: RouteSpec) -> Result<(), ManagerError> {
        let mut servers = self.servers.lock().await;
        if self.cancelled.load(Ordering::Acquire) {
            return Err(ManagerError::Closed);
        }

        let route = Route::new(spec)?;

        if let Some(entry) = servers.get(&port) {
            let live = entry.server.protocol();
            if live != route.protocol() {
                return Err(ManagerError::ProtocolMismatch {
                    port,
                    route_id: route.id().to_string(),
                    live,
                    requested: route.protocol(),
                });
            }

            let certs = if live.is_secure() {
                Some(secure_certs(&entry.table.certificates_with(Some(&route)))?)
            } else {
                None
            };
            entry.table.set(Arc::new(route));
            if let Some(certs) = certs {
                entry.server.swap_certs(certs);
            }
            return Ok(());
        }

        let protocol = route.protocol();
        let table = Arc::new(RouteTable::new(port));
        let certs = if protocol.is_secure() {
            Some(secure_certs(&table.certificates_with(Some(&route)))?)
        } else {
            None
        };
        let route_id = route.id().to_string();
        table.set(Arc::new(route));

        let server = HttpServer::start(
            Arc::clone(&table),
            protocol,
            certs,
            &self.settings,
            Arc::clone(&self.client),
        )?;
        servers.insert(port, PortServer { table, server });
        metrics::set_active_servers(servers.len());
        tracing::info!(port, route_id = %route_id, servers = servers.len(), "Port opened");
        Ok(())
    }

    /// Remove a route. When it was the last on its port, the server is
    /// closed and drained before this returns. Unknown ports or ids are a no-op.
    pub async fn del(&self, port: u16, id: &str) -> Result<(), ManagerError> {
        let draining = {
            let mut servers = self.servers.lock().await;
            let Some(entry) = servers.get(&port) else {
                tracing::debug!(port, route_id = %id, "Delete on port without server");
                return Ok(());
            };

            match entry.table.del(id) {
                None => {
                    tracing::debug!(port, route_id = %id, "Delete of unknown route");
                    None
                }
                Some(0) => {
                    let Some(entry) = servers.remove(&port) else {
                        return Ok(());
                    };
                    metrics::set_active_servers(servers.len());
                    let draining = entry.server.close().await;
                    tracing::info!(port, route_id = %id, servers = servers.len(), "Port closed");
                    Some(draining)
                }
                Some(_) => {
                    if entry.server.protocol().is_secure() {
                        match Certs::new(&entry.table.certificates_with(None)) {
                            Ok(certs) => entry.server.swap_certs(certs),
                            Err(e) => {
                                tracing::warn!(port, error = %e, "Keeping previous certificate store")
                            }
                        }
                    }
                    None
                }
            }
        };

        if let Some(draining) = draining {
            draining.wait().await;
        }
        Ok(())
    }

    /// Close every server. Later calls return immediately.
    pub async fn cancel(&self) {
        let drains: Vec<Draining> = {
            let mut servers = self.servers.lock().await;
            if self.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            let mut drains = Vec::with_capacity(servers.len());
            for (_, entry) in servers.drain() {
                drains.push(entry.server.close().await);
            }
            metrics::set_active_servers(0);
            drains
        };

        tracing::info!(servers = drains.len(), "Draining all servers");
        let mut set = JoinSet::new();
        for draining in drains {
            set.spawn(draining.wait());
        }
        while set.join_next().await.is_some() {}
        tracing::info!("All servers stopped");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub async fn has_server(&self, port: u16) -> bool {
        self.servers.lock().await.contains_key(&port)
    }

    /// Route count on `port`; 0 when no server exists.
    pub async fn route_count(&self, port: u16) -> usize {
        self.servers
            .lock()
            .await
            .get(&port)
            .map_or(0, |e| e.table.count())
    }

    /// Live ports, sorted.
    pub async fn ports(&self) -> Vec<PortStatus> {
        let servers = self.servers.lock().await;
        let mut ports: Vec<PortStatus> = servers
            .iter()
            .map(|(port, entry)| PortStatus {
                port: *port,
                protocol: entry.server.protocol(),
                routes: entry.table.ids(),
                active_connections: entry.server.active_connections(),
                certificate_hosts: entry.server.certificate_hosts(),
            })
            .collect();
        ports.sort_by_key(|p| p.port);
        ports
    }

    /// Check that a server exists exactly for the ports with routes.
    pub async fn check_invariant(&self) -> bool {
        self.servers
            .lock()
            .await
            .values()
            .all(|entry| entry.table.count() > 0)
    }
}

/// A certificate store for an https port. An https port always holds at
/// least one certificate.
fn secure_certs(material: &HashMap<String, CertificateConfig>) -> Result<Certs, ManagerError> {
    if material.is_empty() {
        return Err(TlsError::NoCertificates.into());
    }
    Ok(Certs::new(material)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainError, Filter, Next};
    use crate::context::{EoContext, PassHost, UpstreamHostHandler};
    use crate::router::route::RouteRules;
    use crate::upstream::{BalanceError, BalanceHandler, Node, Service};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Stub;

    #[async_trait]
    impl Filter for Stub {
        async fn do_filter(&self, _ctx: &mut dyn EoContext, _next: Next<'_>) -> Result<(), ChainError> {
            Ok(())
        }
    }

    impl BalanceHandler for Stub {
        fn select(&self, _ctx: &dyn EoContext) -> Result<Arc<Node>, BalanceError> {
            Err(BalanceError::NoNodes("stub".into()))
        }

        fn scheme(&self) -> &str {
            "http"
        }

        fn down_period(&self) -> Duration {
            Duration::ZERO
        }
    }

    impl UpstreamHostHandler for Stub {
        fn pass_host(&self) -> (PassHost, &str) {
            (PassHost::Pass, "")
        }
    }

    impl Service for Stub {
        fn id(&self) -> &str {
            "stub"
        }

        fn name(&self) -> &str {
            "stub"
        }

        fn balance(&self) -> Arc<dyn BalanceHandler> {
            Arc::new(Stub)
        }

        fn upstream_host(&self) -> Arc<dyn UpstreamHostHandler> {
            Arc::new(Stub)
        }

        fn handler(&self) -> Arc<dyn Filter> {
            Arc::new(Stub)
        }
    }

    fn spec(id: &str, protocol: Protocol) -> RouteSpec {
        RouteSpec {
            id: id.to_string(),
            name: id.to_string(),
            protocol,
            certificates: HashMap::new(),
            disabled: false,
            rules: RouteRules::default(),
            service: Arc::new(Stub),
            filters: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn manager() -> Manager {
        let settings = ServerSettings {
            host: "127.0.0.1".to_string(),
            drain_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        Manager::new(settings, Arc::new(UpstreamClient::new().unwrap()))
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_server_follows_route_count() {
        let manager = manager();
        let port = free_port();

        manager.add(port, spec("a", Protocol::Http)).await.unwrap();
        manager.add(port, spec("b", Protocol::Http)).await.unwrap();
        assert!(manager.has_server(port).await);
        assert_eq!(manager.route_count(port).await, 2);

        manager.del(port, "a").await.unwrap();
        assert!(manager.has_server(port).await);

        manager.del(port, "b").await.unwrap();
        assert!(!manager.has_server(port).await);
        // The port is free again.
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn test_failed_bind_rolls_back() {
        let manager = manager();
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let err = manager.add(port, spec("a", Protocol::Http)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Listener(_)));
        assert!(!manager.has_server(port).await);
        assert_eq!(manager.route_count(port).await, 0);
    }

    #[tokio::test]
    async fn test_https_without_certificates_is_rejected() {
        let manager = manager();
        let port = free_port();

        let err = manager.add(port, spec("a", Protocol::Https)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Tls(TlsError::NoCertificates)));
        assert!(!manager.has_server(port).await);
    }

    #[tokio::test]
    async fn test_live_https_port_keeps_a_certificate() {
        let manager = manager();
        let port = free_port();
        let generated = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        let mut secured = spec("a", Protocol::Https);
        secured.certificates.insert(
            "a.test".to_string(),
            CertificateConfig::Pem {
                cert_pem: generated.cert.pem(),
                key_pem: generated.key_pair.serialize_pem(),
            },
        );
        manager.add(port, secured).await.unwrap();

        let err = manager.add(port, spec("a", Protocol::Https)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Tls(TlsError::NoCertificates)));
        assert_eq!(manager.route_count(port).await, 1);

        let servers = manager.servers.lock().await;
        let entry = servers.get(&port).unwrap();
        assert!(entry.table.certificates_with(None).contains_key("a.test"));
        drop(servers);

        manager.cancel().await;
    }

    #[test]
    fn test_secure_certs_requires_material() {
        let err = secure_certs(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ManagerError::Tls(TlsError::NoCertificates)));
    }

    #[tokio::test]
    async fn test_protocol_mismatch_keeps_state() {
        let manager = manager();
        let port = free_port();
        manager.add(port, spec("a", Protocol::Http)).await.unwrap();

        let err = manager.add(port, spec("b", Protocol::Https)).await.unwrap_err();
        assert!(matches!(err, ManagerError::ProtocolMismatch { .. }));
        assert_eq!(manager.route_count(port).await, 1);

        manager.cancel().await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_final() {
        let manager = manager();
        let port = free_port();
        manager.add(port, spec("a", Protocol::Http)).await.unwrap();

        manager.cancel().await;
        manager.cancel().await;
        assert!(manager.is_cancelled());
        assert!(!manager.has_server(port).await);
        assert!(matches!(
            manager.add(port, spec("a", Protocol::Http)).await,
            Err(ManagerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_del_unknown_is_noop() {
        let manager = manager();
        manager.del(1, "missing").await.unwrap();
        assert!(manager.ports().await.is_empty());
    }
}

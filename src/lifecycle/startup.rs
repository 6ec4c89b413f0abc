//! Startup orchestration and config application.
//!
//! # Responsibilities
//! - Wire the registry, built-in drivers, client and manager in order
//! - Turn a validated config into drivers, services and route specs
//! - Apply a config as a difference against what is already live
//!
//! # Design Decisions
//! - Everything for a config is built before the manager is touched, so a
//!   bad driver or service leaves the running state unchanged
//! - A route is re-added only when its router, service or drivers changed
//! - A route that fails to apply keeps its previous state and is retried on
//!   the next reload

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::chain::Filter;
use crate::config::{DriverConfig, GatewayConfig, RouterConfig};
use crate::context::{CompleteHandler, UpstreamClient};
use crate::drivers::{self, Driver, DriverError, DriverRegistry, Profession};
use crate::router::{Manager, ManagerError, RouteSpec};
use crate::upstream::{DiscoveryError, HttpService, Service, ServiceConfig};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("tls client setup: {0}")]
    Client(#[from] rustls::Error),

    #[error(transparent)]
    Registry(#[from] DriverError),

    #[error("driver {name}: {source}")]
    Driver {
        name: String,
        #[source]
        source: DriverError,
    },

    #[error("{owner} needs a {expected} driver, {name} is {actual}")]
    WrongProfession {
        owner: String,
        name: String,
        expected: &'static str,
        actual: Profession,
    },

    #[error("{owner} references unknown {kind} {name:?}")]
    Unknown {
        owner: String,
        kind: &'static str,
        name: String,
    },

    #[error("service {service}: {source}")]
    Service {
        service: String,
        #[source]
        source: DiscoveryError,
    },

    #[error("router {router} on port {port}: {source}")]
    Route {
        router: String,
        port: u16,
        #[source]
        source: ManagerError,
    },

    #[error("{} route change(s) failed: {}", .0.len(), join(.0))]
    Partial(Vec<GatewayError>),
}

fn join(errors: &[GatewayError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Inputs a live route was built from.
#[derive(Debug, Clone, PartialEq)]
struct AppliedRoute {
    router: RouterConfig,
    service: Option<ServiceConfig>,
    drivers: Vec<Option<DriverConfig>>,
}

impl AppliedRoute {
    fn from_config(config: &GatewayConfig, router: &RouterConfig) -> Self {
        let service = config.services.iter().find(|s| s.id == router.service).cloned();
        let driver = |name: &str| config.drivers.iter().find(|d| d.name == name).cloned();
        let mut drivers: Vec<Option<DriverConfig>> = router
            .plugins
            .iter()
            .chain(&router.outputs)
            .map(|n| driver(n))
            .collect();
        if let Some(service) = &service {
            drivers.push(driver(&service.discovery));
        }
        Self {
            router: router.clone(),
            service,
            drivers,
        }
    }
}

/// The wired gateway: registry, manager and what has been applied so far.
pub struct Gateway {
    registry: Arc<DriverRegistry>,
    manager: Arc<Manager>,
    applied: Mutex<HashMap<String, AppliedRoute>>,
}

impl Gateway {
    /// Registry with built-ins, upstream client, then the manager.
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let registry = Arc::new(DriverRegistry::new());
        drivers::register_builtin(&registry)?;
        tracing::info!(drivers = registry.keys().len(), "Driver registry ready");

        let client = Arc::new(UpstreamClient::new()?);
        let manager = Arc::new(Manager::new(config.server_settings(), client));

        Ok(Self {
            registry,
            manager,
            applied: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Ids of the routes currently applied, sorted.
    pub async fn route_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.applied.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Make the live routes match `config`.
    pub async fn apply(&self, config: &GatewayConfig) -> Result<(), GatewayError> {
        let mut applied = self.applied.lock().await;

        let wanted: HashMap<&str, AppliedRoute> = config
            .routers
            .iter()
            .map(|r| (r.id.as_str(), AppliedRoute::from_config(config, r)))
            .collect();
        let changed: Vec<&RouterConfig> = config
            .routers
            .iter()
            .filter(|r| applied.get(&r.id) != wanted.get(r.id.as_str()))
            .collect();

        let specs = if changed.is_empty() {
            Vec::new()
        } else {
            self.build(config, &changed)?
        };

        let mut errors = Vec::new();

        // Removals first, including routes that moved to another port or
        // switched protocol. A port whose routes all switch is torn down
        // before its replacement is bound.
        let stale: Vec<(String, u16)> = applied
            .iter()
            .filter(|(id, live)| {
                wanted.get(id.as_str()).map_or(true, |w| {
                    w.router.port != live.router.port || w.router.protocol != live.router.protocol
                })
            })
            .map(|(id, live)| (id.clone(), live.router.port))
            .collect();
        for (id, port) in stale {
            match self.manager.del(port, &id).await {
                Ok(()) => {
                    applied.remove(&id);
                }
                Err(source) => errors.push(GatewayError::Route {
                    router: id,
                    port,
                    source,
                }),
            }
        }

        for (router, spec) in specs {
            match self.manager.add(router.port, spec).await {
                Ok(()) => {
                    if let Some(state) = wanted.get(router.id.as_str()) {
                        applied.insert(router.id.clone(), state.clone());
                    }
                }
                Err(source) => errors.push(GatewayError::Route {
                    router: router.id.clone(),
                    port: router.port,
                    source,
                }),
            }
        }

        tracing::info!(
            routes = applied.len(),
            changed = changed.len(),
            failed = errors.len(),
            "Config applied"
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Partial(errors))
        }
    }

    /// Drivers, services and route specs for `routers`.
    fn build<'a>(
        &self,
        config: &GatewayConfig,
        routers: &[&'a RouterConfig],
    ) -> Result<Vec<(&'a RouterConfig, RouteSpec)>, GatewayError> {
        let mut drivers: HashMap<&str, Driver> = HashMap::new();
        for d in &config.drivers {
            let driver = self
                .registry
                .create(&d.driver, &d.name, &d.label, &d.desc, &d.params)
                .map_err(|source| GatewayError::Driver {
                    name: d.name.clone(),
                    source,
                })?;
            drivers.insert(d.name.as_str(), driver);
        }

        let mut services: HashMap<&str, Arc<dyn Service>> = HashMap::new();
        for s in &config.services {
            let discovery = lookup(&drivers, &s.id, &s.discovery)?
                .as_discovery()
                .ok_or_else(|| wrong(&drivers, &s.id, &s.discovery, "discovery"))?;
            let service = HttpService::new(s, discovery.as_ref()).map_err(|source| {
                GatewayError::Service {
                    service: s.id.clone(),
                    source,
                }
            })?;
            services.insert(s.id.as_str(), Arc::new(service));
        }

        routers
            .iter()
            .map(|router| {
                let owner = format!("router {}", router.id);
                let service = services
                    .get(router.service.as_str())
                    .cloned()
                    .ok_or_else(|| GatewayError::Unknown {
                        owner: owner.clone(),
                        kind: "service",
                        name: router.service.clone(),
                    })?;

                let mut filters: Vec<Arc<dyn Filter>> = Vec::with_capacity(router.plugins.len());
                for name in &router.plugins {
                    let filter = lookup(&drivers, &owner, name)?
                        .as_filter()
                        .ok_or_else(|| wrong(&drivers, &owner, name, "auth or router"))?;
                    filters.push(filter);
                }

                let mut outputs: Vec<Arc<dyn CompleteHandler>> = Vec::with_capacity(router.outputs.len());
                for name in &router.outputs {
                    let output = lookup(&drivers, &owner, name)?
                        .as_output()
                        .ok_or_else(|| wrong(&drivers, &owner, name, "output"))?;
                    outputs.push(output);
                }

                let spec = RouteSpec {
                    id: router.id.clone(),
                    name: router.display_name().to_string(),
                    protocol: router.protocol,
                    certificates: router.certificates.clone(),
                    disabled: router.disable,
                    rules: router.rules.clone(),
                    service,
                    filters,
                    outputs,
                };
                Ok((*router, spec))
            })
            .collect()
    }

    /// Apply every config received until shutdown.
    pub async fn watch(
        self: Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                update = updates.recv() => match update {
                    Some(config) => {
                        if let Err(e) = self.apply(&config).await {
                            tracing::error!(error = %e, "Config reload failed, previous routes kept where possible");
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Config reload loop stopped");
    }

    /// Stop every port server.
    pub async fn shutdown(&self) {
        self.manager.cancel().await;
    }
}

fn lookup<'d>(
    drivers: &'d HashMap<&str, Driver>,
    owner: &str,
    name: &str,
) -> Result<&'d Driver, GatewayError> {
    drivers.get(name).ok_or_else(|| GatewayError::Unknown {
        owner: owner.to_string(),
        kind: "driver",
        name: name.to_string(),
    })
}

fn wrong(drivers: &HashMap<&str, Driver>, owner: &str, name: &str, expected: &'static str) -> GatewayError {
    GatewayError::WrongProfession {
        owner: owner.to_string(),
        name: name.to_string(),
        expected,
        actual: drivers
            .get(name)
            .map_or(Profession::Router, |d| d.profession()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn free_ports<const N: usize>() -> [u16; N] {
        let held: Vec<_> = (0..N)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        std::array::from_fn(|i| held[i].local_addr().unwrap().port())
    }

    fn config(port: u16, extra_router: &str) -> GatewayConfig {
        let raw = format!(
            r#"
            [server]
            host = "127.0.0.1"

            [timeouts]
            drain_secs = 1

            [[drivers]]
            name = "static"
            driver = "edge:gateway:discovery_static"

            [[drivers]]
            name = "log"
            driver = "edge:gateway:output_access_log"

            [[services]]
            id = "svc"
            discovery = "static"
            nodes = "127.0.0.1:9"

            [[routers]]
            id = "main"
            port = {port}
            service = "svc"
            outputs = ["log"]
            {extra_router}
            "#
        );
        parse_config(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_apply_then_remove() {
        let [port] = free_ports();
        let first = config(port, "");
        let gateway = Gateway::new(&first).unwrap();

        gateway.apply(&first).await.unwrap();
        assert!(gateway.manager().has_server(port).await);
        assert_eq!(gateway.route_ids().await, ["main"]);

        // Re-applying the same config is a no-op.
        gateway.apply(&first).await.unwrap();
        assert_eq!(gateway.manager().route_count(port).await, 1);

        let mut empty = first.clone();
        empty.routers.clear();
        gateway.apply(&empty).await.unwrap();
        assert!(!gateway.manager().has_server(port).await);
        assert!(gateway.route_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_profession_leaves_state() {
        let [port] = free_ports();
        let good = config(port, "");
        let gateway = Gateway::new(&good).unwrap();
        gateway.apply(&good).await.unwrap();

        let bad = config(port, r#"plugins = ["log"]"#);
        let err = gateway.apply(&bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::WrongProfession { .. }));
        assert_eq!(gateway.manager().route_count(port).await, 1);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_route_moves_port() {
        let [first_port, second_port] = free_ports();
        let first = config(first_port, "");
        let gateway = Gateway::new(&first).unwrap();
        gateway.apply(&first).await.unwrap();

        let moved = config(second_port, "");
        gateway.apply(&moved).await.unwrap();
        assert!(!gateway.manager().has_server(first_port).await);
        assert!(gateway.manager().has_server(second_port).await);

        gateway.shutdown().await;
    }
}

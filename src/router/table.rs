//! Per-port route table.
//!
//! # Responsibilities
//! - Upsert and remove routes by id
//! - Keep a sorted snapshot for lock-free lookup
//! - Report counts so the manager can create or tear down the server
//!
//! # Design Decisions
//! - Writers serialize on a mutex and publish a fresh snapshot via `ArcSwap`
//! - Dispatch only loads the snapshot, so a route change never blocks requests
//! - The server holds the same `Arc<RouteTable>`, so updates are visible on
//!   the next dispatch

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::RequestReader;
use crate::net::CertificateConfig;
use crate::router::route::Route;

#[derive(Debug)]
pub struct RouteTable {
    port: u16,
    routes: Mutex<HashMap<String, Arc<Route>>>,
    ordered: ArcSwap<Vec<Arc<Route>>>,
}

impl RouteTable {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            routes: Mutex::new(HashMap::new()),
            ordered: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Route>>> {
        // Every mutation leaves the map consistent, so a poisoned lock is usable.
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, routes: &HashMap<String, Arc<Route>>) {
        let mut ordered: Vec<Arc<Route>> = routes.values().cloned().collect();
        ordered.sort_by(|a, b| a.precedes(b));
        self.ordered.store(Arc::new(ordered));
    }

    /// Insert or replace. Returns true when the id was new.
    pub fn set(&self, route: Arc<Route>) -> bool {
        let mut routes = self.lock();
        let id = route.id().to_string();
        let created = routes.insert(id.clone(), route).is_none();
        self.publish(&routes);
        tracing::info!(
            port = self.port,
            route_id = %id,
            created,
            routes = routes.len(),
            "Route set"
        );
        created
    }

    /// Remove `id`. Returns the remaining count, or `None` if `id` was absent.
    pub fn del(&self, id: &str) -> Option<usize> {
        let mut routes = self.lock();
        routes.remove(id)?;
        self.publish(&routes);
        tracing::info!(port = self.port, route_id = %id, routes = routes.len(), "Route removed");
        Some(routes.len())
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Route>> {
        self.lock().get(id).cloned()
    }

    /// Route ids in match order.
    pub fn ids(&self) -> Vec<String> {
        self.ordered.load().iter().map(|r| r.id().to_string()).collect()
    }

    /// First route matching `req`, in precedence order.
    pub fn find(&self, req: &RequestReader) -> Option<Arc<Route>> {
        self.ordered.load().iter().find(|r| r.matches(req)).cloned()
    }

    /// Union of certificate material across routes, with `candidate` standing
    /// in for any route with the same id. Lower route ids win on host conflicts.
    pub fn certificates_with(&self, candidate: Option<&Route>) -> HashMap<String, CertificateConfig> {
        let routes = self.lock();
        let mut ordered: Vec<&Route> = routes
            .values()
            .map(|r| r.as_ref())
            .filter(|r| candidate.map_or(true, |c| c.id() != r.id()))
            .chain(candidate)
            .collect();
        ordered.sort_by(|a, b| b.id().cmp(a.id()));

        let mut merged = HashMap::new();
        for route in ordered {
            for (host, material) in route.certificates() {
                merged.insert(host.to_ascii_lowercase(), material.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainError, Filter, Next};
    use crate::context::{EoContext, PassHost, UpstreamHostHandler};
    use crate::router::route::{Protocol, RouteRules, RouteSpec};
    use crate::upstream::{BalanceError, BalanceHandler, Node, Service};
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderValue, Method, Uri, Version};
    use bytes::Bytes;
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

    fn route(id: &str, hosts: &[&str], prefix: &str) -> Arc<Route> {
        secure_route(id, hosts, prefix, &[])
    }

    fn pem(tag: &str) -> CertificateConfig {
        CertificateConfig::Pem {
            cert_pem: format!("cert-{tag}"),
            key_pem: format!("key-{tag}"),
        }
    }

    fn secure_route(id: &str, hosts: &[&str], prefix: &str, certs: &[(&str, &str)]) -> Arc<Route> {
        let spec = RouteSpec {
            id: id.to_string(),
            name: id.to_string(),
            protocol: if certs.is_empty() { Protocol::Http } else { Protocol::Https },
            certificates: certs
                .iter()
                .map(|(host, tag)| (host.to_string(), pem(tag)))
                .collect(),
            disabled: false,
            rules: RouteRules {
                hosts: hosts.iter().map(|h| h.to_string()).collect(),
                path_prefix: prefix.to_string(),
                ..Default::default()
            },
            service: Arc::new(Stub),
            filters: Vec::new(),
            outputs: Vec::new(),
        };
        Arc::new(Route::new(spec).unwrap())
    }

    fn req(host: &str, path: &str) -> RequestReader {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(host).unwrap());
        RequestReader::new(
            Method::GET,
            path.parse::<Uri>().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            "127.0.0.1:1000".parse().unwrap(),
            false,
        )
    }

    #[test]
    fn test_set_replaces_by_id() {
        let table = RouteTable::new(8080);
        assert!(table.set(route("a", &[], "/")));
        assert!(!table.set(route("a", &[], "/v2")));
        assert_eq!(table.count(), 1);
        assert!(table.find(&req("x", "/v2/items")).is_some());
        assert!(table.find(&req("x", "/other")).is_none());
    }

    #[test]
    fn test_del_reports_remaining() {
        let table = RouteTable::new(8080);
        table.set(route("a", &[], "/"));
        table.set(route("b", &[], "/"));

        assert_eq!(table.del("missing"), None);
        assert_eq!(table.del("a"), Some(1));
        assert_eq!(table.del("b"), Some(0));
        assert_eq!(table.count(), 0);
        assert!(table.find(&req("x", "/")).is_none());
    }

    #[test]
    fn test_find_prefers_specific_routes() {
        let table = RouteTable::new(8080);
        table.set(route("catch-all", &[], ""));
        table.set(route("api", &[], "/api"));
        table.set(route("host", &["shop.example.com"], ""));

        assert_eq!(table.find(&req("shop.example.com", "/api")).unwrap().id(), "host");
        assert_eq!(table.find(&req("other.com", "/api/x")).unwrap().id(), "api");
        assert_eq!(table.find(&req("other.com", "/")).unwrap().id(), "catch-all");
        assert_eq!(table.ids(), ["host", "api", "catch-all"]);
    }

    #[test]
    fn test_certificates_union_with_candidate() {
        let table = RouteTable::new(8443);
        table.set(secure_route("a", &[], "/", &[("a.test", "a1")]));
        table.set(secure_route("b", &[], "/", &[("b.test", "b1"), ("A.test", "b-shared")]));

        let merged = table.certificates_with(None);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["a.test"], pem("a1"));
        assert_eq!(merged["b.test"], pem("b1"));

        let replacement = secure_route("b", &[], "/", &[("c.test", "c1")]);
        let merged = table.certificates_with(Some(&*replacement));
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["a.test"], pem("a1"));
        assert_eq!(merged["c.test"], pem("c1"));
        assert!(!merged.contains_key("b.test"));
    }
}

//! HTTP upstream service.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::chain::Filter;
use crate::context::{PassHost, UpstreamHostHandler};
use crate::upstream::{BalanceHandler, Discovery, DiscoveryError, RoundRobin, Service, Upstream};

/// One `[[services]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub id: String,

    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,

    /// `http` or `https` towards the nodes.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Name of a discovery driver instance.
    pub discovery: String,

    /// Discovery-specific config, e.g. `"10.0.0.1:80 weight=2;10.0.0.2:80"`.
    pub nodes: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Extra attempts after the first failed one.
    #[serde(default)]
    pub retry: usize,

    #[serde(default)]
    pub pass_host: PassHost,

    /// Host header used with `pass_host = "rewrite"`.
    #[serde(default)]
    pub upstream_host: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_timeout_ms() -> u64 {
    3000
}

impl ServiceConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone)]
struct HostPolicy {
    pass_host: PassHost,
    upstream_host: String,
}

impl UpstreamHostHandler for HostPolicy {
    fn pass_host(&self) -> (PassHost, &str) {
        (self.pass_host, &self.upstream_host)
    }
}

/// Service built from a `ServiceConfig` and a discovery driver.
pub struct HttpService {
    id: String,
    name: String,
    balance: Arc<RoundRobin>,
    host: Arc<HostPolicy>,
    handler: Arc<dyn Filter>,
}

impl HttpService {
    pub fn new(config: &ServiceConfig, discovery: &dyn Discovery) -> Result<Self, DiscoveryError> {
        let app = discovery.get_app(&config.nodes)?;
        let handler: Arc<dyn Filter> = Upstream::create(&config.id, config.retry, config.timeout());
        Ok(Self {
            id: config.id.clone(),
            name: config.display_name().to_string(),
            balance: Arc::new(RoundRobin::new(&config.id, &config.scheme, app)),
            host: Arc::new(HostPolicy {
                pass_host: config.pass_host,
                upstream_host: config.upstream_host.clone(),
            }),
            handler,
        })
    }
}

impl Service for HttpService {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn balance(&self) -> Arc<dyn BalanceHandler> {
        self.balance.clone()
    }

    fn upstream_host(&self) -> Arc<dyn UpstreamHostHandler> {
        self.host.clone()
    }

    fn handler(&self) -> Arc<dyn Filter> {
        self.handler.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::discovery::{parse_nodes, App};

    struct Fixed;

    impl Discovery for Fixed {
        fn get_app(&self, config: &str) -> Result<Arc<App>, DiscoveryError> {
            Ok(Arc::new(App::new(parse_nodes(config)?, Duration::ZERO)))
        }
    }

    fn config(toml_text: &str) -> ServiceConfig {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn test_defaults() {
        let c = config("id = \"users\"\ndiscovery = \"static\"\nnodes = \"10.0.0.1:80\"");
        assert_eq!(c.scheme, "http");
        assert_eq!(c.timeout(), Duration::from_secs(3));
        assert_eq!(c.retry, 0);
        assert_eq!(c.pass_host, PassHost::Pass);
        assert_eq!(c.display_name(), "users");
    }

    #[test]
    fn test_service_exposes_host_policy() {
        let c = config(
            "id = \"users\"\nname = \"Users\"\ndiscovery = \"static\"\nnodes = \"10.0.0.1:80\"\n\
             pass_host = \"rewrite\"\nupstream_host = \"users.internal\"",
        );
        let service = HttpService::new(&c, &Fixed).unwrap();
        assert_eq!(service.name(), "Users");
        let host = service.upstream_host();
        assert_eq!(host.pass_host(), (PassHost::Rewrite, "users.internal"));
        assert_eq!(service.balance().scheme(), "http");
    }

    #[test]
    fn test_bad_nodes_fail_construction() {
        let c = config("id = \"users\"\ndiscovery = \"static\"\nnodes = \"nope\"");
        assert!(HttpService::new(&c, &Fixed).is_err());
    }
}

//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::net::CertificateConfig;
use crate::router::{Protocol, RouteRules, ServerSettings};
use crate::upstream::ServiceConfig;

/// Root configuration for the gateway.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener defaults shared by every port.
    pub server: ServerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,

    /// Driver instances, referenced by name from services and routers.
    pub drivers: Vec<DriverConfig>,

    /// Upstream services.
    pub services: Vec<ServiceConfig>,

    /// Routes, each bound to a port.
    pub routers: Vec<RouterConfig>,
}

impl GatewayConfig {
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            host: self.server.host.clone(),
            max_connections: self.server.max_connections,
            max_body_bytes: self.server.max_body_bytes,
            request_timeout: Duration::from_secs(self.timeouts.request_secs),
            handshake_timeout: Duration::from_secs(self.timeouts.handshake_secs),
            drain_timeout: Duration::from_secs(self.timeouts.drain_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host for every port (e.g., "0.0.0.0").
    pub host: String,

    /// Maximum concurrent connections per port (backpressure).
    pub max_connections: usize,

    /// Largest request body buffered before proxying.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            max_connections: 10_000,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Ceiling for one request, end to end, in seconds.
    pub request_secs: u64,

    /// How long a closing port waits for in-flight connections.
    pub drain_secs: u64,

    /// TLS handshake timeout in seconds.
    pub handshake_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 60,
            drain_secs: 30,
            handshake_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// One driver instance: `driver` is a registration key such as
/// `edge:gateway:auth_apikey`, `params` its opaque string parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DriverConfig {
    pub name: String,

    pub driver: String,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub desc: String,

    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// One `[[routers]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouterConfig {
    pub id: String,

    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,

    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    /// Host name to certificate material, required for `https`.
    #[serde(default)]
    pub certificates: HashMap<String, CertificateConfig>,

    #[serde(default)]
    pub disable: bool,

    #[serde(flatten)]
    pub rules: RouteRules,

    /// Service id.
    pub service: String,

    /// Auth or router driver names, run in order before the upstream.
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Output driver names, run once the response is written.
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl RouterConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PassHost;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.server_settings().drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_full_config_parses() {
        let raw = r#"
            [server]
            host = "127.0.0.1"

            [observability]
            log_format = "pretty"

            [[drivers]]
            name = "static"
            driver = "edge:gateway:discovery_static"
            params = { health_check = "true", down_period_ms = "5000" }

            [[services]]
            id = "orders"
            discovery = "static"
            nodes = "127.0.0.1:9001 weight=2; 127.0.0.1:9002"
            retry = 1
            pass_host = "rewrite"
            upstream_host = "orders.internal"

            [[routers]]
            id = "orders-api"
            port = 8443
            protocol = "https"
            hosts = ["api.example.com"]
            path_prefix = "/orders"
            methods = ["GET", "POST"]
            service = "orders"
            plugins = ["keys"]

            [routers.certificates."api.example.com"]
            cert_path = "/etc/certs/api.pem"
            key_path = "/etc/certs/api.key"
        "#;
        let config: GatewayConfig = toml::from_str(raw).unwrap();

        assert_eq!(config.observability.log_format, LogFormat::Pretty);
        assert_eq!(config.drivers[0].params["down_period_ms"], "5000");
        assert_eq!(config.services[0].pass_host, PassHost::Rewrite);

        let router = &config.routers[0];
        assert_eq!(router.protocol, Protocol::Https);
        assert_eq!(router.rules.path_prefix, "/orders");
        assert_eq!(router.rules.methods, ["GET", "POST"]);
        assert_eq!(router.display_name(), "orders-api");
        assert!(matches!(
            router.certificates["api.example.com"],
            CertificateConfig::Files { .. }
        ));
    }
}

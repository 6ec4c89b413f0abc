//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routers → services, plugins, outputs; services → discovery)
//! - Validate value ranges (timeouts > 0, ports valid)
//! - Detect conflicting routers (duplicate ids, mixed protocols on one port)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Driver keys are checked against the registry when the config is applied

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::config::schema::GatewayConfig;
use crate::context::PassHost;
use crate::router::Protocol;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{kind} with empty id")]
    EmptyId { kind: &'static str },

    #[error("duplicate {kind} {id:?}")]
    Duplicate { kind: &'static str, id: String },

    #[error("{owner:?} references unknown {kind} {name:?}")]
    UnknownReference {
        owner: String,
        kind: &'static str,
        name: String,
    },

    #[error("router {router:?} uses port 0")]
    ZeroPort { router: String },

    #[error("https router {router:?} has no certificates")]
    MissingCertificates { router: String },

    #[error("port {port} mixes http and https routers")]
    MixedProtocols { port: u16 },

    #[error("service {service:?} rewrites the host but sets no upstream_host")]
    RewriteWithoutHost { service: String },

    #[error("service {service:?} has unsupported scheme {scheme:?}")]
    UnsupportedScheme { service: String, scheme: String },
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let ranges: [(&'static str, u64); 5] = [
        ("server.max_connections", config.server.max_connections as u64),
        ("server.max_body_bytes", config.server.max_body_bytes as u64),
        ("timeouts.request_secs", config.timeouts.request_secs),
        ("timeouts.drain_secs", config.timeouts.drain_secs),
        ("timeouts.handshake_secs", config.timeouts.handshake_secs),
    ];
    for (field, value) in ranges {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    let drivers = unique_ids(
        "driver",
        config.drivers.iter().map(|d| d.name.as_str()),
        &mut errors,
    );
    let services = unique_ids(
        "service",
        config.services.iter().map(|s| s.id.as_str()),
        &mut errors,
    );
    unique_ids(
        "router",
        config.routers.iter().map(|r| r.id.as_str()),
        &mut errors,
    );

    for service in &config.services {
        if !drivers.contains(service.discovery.as_str()) {
            errors.push(ValidationError::UnknownReference {
                owner: service.id.clone(),
                kind: "discovery driver",
                name: service.discovery.clone(),
            });
        }
        if service.pass_host == PassHost::Rewrite && service.upstream_host.trim().is_empty() {
            errors.push(ValidationError::RewriteWithoutHost {
                service: service.id.clone(),
            });
        }
        if service.scheme != "http" && service.scheme != "https" {
            errors.push(ValidationError::UnsupportedScheme {
                service: service.id.clone(),
                scheme: service.scheme.clone(),
            });
        }
    }

    let mut protocols: HashMap<u16, Protocol> = HashMap::new();
    let mut mixed: HashSet<u16> = HashSet::new();
    for router in &config.routers {
        if router.port == 0 {
            errors.push(ValidationError::ZeroPort {
                router: router.id.clone(),
            });
        }
        if router.protocol.is_secure() && router.certificates.is_empty() {
            errors.push(ValidationError::MissingCertificates {
                router: router.id.clone(),
            });
        }
        let live = *protocols.entry(router.port).or_insert(router.protocol);
        if live != router.protocol && mixed.insert(router.port) {
            errors.push(ValidationError::MixedProtocols { port: router.port });
        }

        if !services.contains(router.service.as_str()) {
            errors.push(ValidationError::UnknownReference {
                owner: router.id.clone(),
                kind: "service",
                name: router.service.clone(),
            });
        }
        for name in router.plugins.iter().chain(&router.outputs) {
            if !drivers.contains(name.as_str()) {
                errors.push(ValidationError::UnknownReference {
                    owner: router.id.clone(),
                    kind: "driver",
                    name: name.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn unique_ids<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a str>,
    errors: &mut Vec<ValidationError>,
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            errors.push(ValidationError::EmptyId { kind });
        } else if !seen.insert(id) {
            errors.push(ValidationError::Duplicate {
                kind,
                id: id.to_string(),
            });
        }
    }
    seen
}

//! One compiled route.
//!
//! # Responsibilities
//! - Compile match rules into a matcher
//! - Prepare the context for its chain (labels and handlers)
//! - Run the chain, or stop early when disabled

use axum::http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::chain::{ChainError, Filter, FilterChain};
use crate::context::{
    CompleteHandler, CompleteHandlers, EoContext, ErrorFinisher, Finisher, RequestReader, LABEL_API,
    LABEL_API_ID, LABEL_IP, LABEL_SERVICE, LABEL_SERVICE_ID,
};
use crate::net::CertificateConfig;
use crate::router::matcher::{AndMatcher, HostMatcher, Matcher, MethodMatcher, PathPrefixMatcher};
use crate::router::ROUTE_DISABLED;
use crate::upstream::Service;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route {route_id}: invalid method {method:?}")]
    InvalidMethod { route_id: String, method: String },

    #[error("route {route_id}: path prefix must start with '/'")]
    InvalidPrefix { route_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::Https)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

/// Match conditions of a route. Empty conditions match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteRules {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub path_prefix: String,

    #[serde(default)]
    pub methods: Vec<String>,

    /// Higher wins among overlapping routes.
    #[serde(default)]
    pub priority: i32,
}

/// Everything the manager needs to install a route.
#[derive(Clone)]
pub struct RouteSpec {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub certificates: HashMap<String, CertificateConfig>,
    pub disabled: bool,
    pub rules: RouteRules,
    pub service: Arc<dyn Service>,
    /// Plugin links, run before the service's upstream handler.
    pub filters: Vec<Arc<dyn Filter>>,
    pub outputs: Vec<Arc<dyn CompleteHandler>>,
}

impl std::fmt::Debug for RouteSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("disabled", &self.disabled)
            .field("rules", &self.rules)
            .field("service", &self.service.id())
            .field("filters", &self.filters.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// A route ready for dispatch.
pub struct Route {
    id: String,
    name: String,
    protocol: Protocol,
    disabled: bool,
    certificates: HashMap<String, CertificateConfig>,
    matcher: AndMatcher,
    priority: i32,
    host_rank: u8,
    prefix_len: usize,
    service: Arc<dyn Service>,
    chain: FilterChain,
    complete: Option<Arc<dyn CompleteHandler>>,
}

impl Route {
    pub fn new(spec: RouteSpec) -> Result<Self, RouteError> {
        let RouteSpec {
            id,
            name,
            protocol,
            certificates,
            disabled,
            rules,
            service,
            filters,
            outputs,
        } = spec;

        if !rules.path_prefix.is_empty() && !rules.path_prefix.starts_with('/') {
            return Err(RouteError::InvalidPrefix { route_id: id });
        }

        let mut methods = Vec::with_capacity(rules.methods.len());
        for m in &rules.methods {
            match Method::from_str(&m.to_ascii_uppercase()) {
                Ok(method) => methods.push(method),
                Err(_) => {
                    return Err(RouteError::InvalidMethod {
                        route_id: id,
                        method: m.clone(),
                    })
                }
            }
        }

        let hosts = HostMatcher::new(&rules.hosts);
        let prefix = PathPrefixMatcher::new(rules.path_prefix.clone());
        let host_rank = hosts.specificity();
        let prefix_len = prefix.len();
        let matcher = AndMatcher::new(vec![
            Box::new(hosts),
            Box::new(prefix),
            Box::new(MethodMatcher::new(methods)),
        ]);

        let chain = FilterChain::new(filters).append([service.handler()]);
        let complete: Option<Arc<dyn CompleteHandler>> = match outputs.len() {
            0 => None,
            1 => outputs.into_iter().next(),
            _ => Some(Arc::new(CompleteHandlers::new(outputs))),
        };

        Ok(Self {
            id,
            name,
            protocol,
            disabled,
            certificates,
            matcher,
            priority: rules.priority,
            host_rank,
            prefix_len,
            service,
            chain,
            complete,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn certificates(&self) -> &HashMap<String, CertificateConfig> {
        &self.certificates
    }

    pub fn matches(&self, req: &RequestReader) -> bool {
        self.matcher.matches(req)
    }

    /// Sort key: priority desc, host specificity desc, prefix length desc, id asc.
    pub(crate) fn precedes(&self, other: &Route) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.host_rank.cmp(&self.host_rank))
            .then(other.prefix_len.cmp(&self.prefix_len))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Label the context, install handlers and run the chain.
    ///
    /// A disabled route leaves a 503 outcome and never touches the chain.
    pub async fn serve(&self, ctx: &mut dyn EoContext) -> Result<(), ChainError> {
        let ip = ctx.request().real_ip();
        ctx.set_label(LABEL_API, &self.name);
        ctx.set_label(LABEL_API_ID, &self.id);
        ctx.set_label(LABEL_SERVICE, self.service.name());
        ctx.set_label(LABEL_SERVICE_ID, self.service.id());
        ctx.set_label(LABEL_IP, &ip);
        if let Some(complete) = &self.complete {
            ctx.set_complete_handler(Arc::clone(complete));
        }

        if self.disabled {
            tracing::debug!(
                request_id = %ctx.request_id(),
                route_id = %self.id,
                "Route is disabled"
            );
            ctx.set_finish_handler(Arc::new(ErrorFinisher::new(
                StatusCode::SERVICE_UNAVAILABLE,
                ROUTE_DISABLED,
            )));
            return Ok(());
        }

        ctx.set_app(Arc::clone(&self.service));
        ctx.set_balance(self.service.balance());
        ctx.set_upstream_host(self.service.upstream_host());
        ctx.set_finish_handler(Arc::new(Finisher));

        self.chain.chain(ctx).await
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("disabled", &self.disabled)
            .field("matcher", &self.matcher)
            .field("chain", &self.chain.len())
            .finish()
    }
}

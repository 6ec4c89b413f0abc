//! Static discovery: node lists written inline in service config.

use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::drivers::params::from_text;
use crate::drivers::{Driver, DriverError, DriverInfo, DriverKey, DriverRegistry, Profession, TypedFactory};
use crate::upstream::discovery::{parse_nodes, App, Discovery, DiscoveryError};

pub const KIND: &str = "static";

#[derive(Debug, Deserialize)]
pub struct StaticConfig {
    /// Enable passive health: a node that fails a call is skipped for a while.
    #[serde(default, deserialize_with = "from_text")]
    pub health_check: bool,

    #[serde(default = "default_down_period_ms", deserialize_with = "from_text")]
    pub down_period_ms: u64,
}

fn default_down_period_ms() -> u64 {
    30_000
}

/// Resolves node lists from the config string itself.
///
/// Apps are cached per config string so node health survives across
/// services that share a node list.
pub struct StaticDiscovery {
    name: String,
    down_period: Duration,
    apps: DashMap<String, Arc<App>>,
}

impl StaticDiscovery {
    pub fn new(name: impl Into<String>, config: StaticConfig) -> Self {
        let down_period = if config.health_check {
            Duration::from_millis(config.down_period_ms)
        } else {
            Duration::ZERO
        };
        Self {
            name: name.into(),
            down_period,
            apps: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Discovery for StaticDiscovery {
    fn get_app(&self, config: &str) -> Result<Arc<App>, DiscoveryError> {
        let key = config.trim();
        if let Some(app) = self.apps.get(key) {
            return Ok(app.clone());
        }
        let app = Arc::new(App::new(parse_nodes(key)?, self.down_period));
        Ok(self.apps.entry(key.to_string()).or_insert(app).clone())
    }
}

pub fn register(registry: &DriverRegistry) -> Result<(), DriverError> {
    let key = DriverKey::builtin(Profession::Discovery, KIND).to_string();
    registry.register(
        &key,
        Arc::new(TypedFactory::new(|info: &DriverInfo, config: StaticConfig| {
            Ok(Driver::Discovery(Arc::new(StaticDiscovery::new(&info.name, config))))
        })),
    )
}

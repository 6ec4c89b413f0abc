//! Pluggable drivers.
//!
//! # Data Flow
//! ```text
//! Startup
//!     → registry.rs (key → factory, duplicates rejected)
//! [[drivers]] config entry
//!     → registry.create(key, name, label, desc, params)
//!         → params.rs (string map → typed config)
//!         → factory builds a Driver
//!     → auth/router drivers become chain links
//!     → discovery drivers back services
//!     → output drivers become complete handlers
//! ```
//!
//! # Design Decisions
//! - Each driver kind declares its config type at compile time through
//!   `TypedFactory<C, _>`; the registry only stores type-erased factories
//! - The registry is an explicit instance passed to whoever needs it

pub mod auth_apikey;
pub mod discovery_static;
pub mod output_access_log;
pub mod params;
pub mod registry;

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::chain::Filter;
use crate::context::CompleteHandler;
use crate::upstream::Discovery;

pub use registry::DriverRegistry;

/// Vendor and product of the built-in drivers.
pub const BUILTIN_VENDOR: &str = "edge";
pub const BUILTIN_PRODUCT: &str = "gateway";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid driver key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("driver {0} is already registered")]
    Duplicate(String),

    #[error("driver {0} is not registered")]
    NotFound(String),

    #[error("invalid params for driver {driver}: {reason}")]
    InvalidParams { driver: String, reason: String },

    #[error("driver {key} produced a {actual} driver, expected {expected}")]
    ProfessionMismatch {
        key: String,
        expected: Profession,
        actual: Profession,
    },
}

/// Categorical kind of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Profession {
    Auth,
    Discovery,
    Output,
    Router,
}

impl fmt::Display for Profession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profession::Auth => write!(f, "auth"),
            Profession::Discovery => write!(f, "discovery"),
            Profession::Output => write!(f, "output"),
            Profession::Router => write!(f, "router"),
        }
    }
}

impl FromStr for Profession {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Profession::Auth),
            "discovery" => Ok(Profession::Discovery),
            "output" => Ok(Profession::Output),
            "router" => Ok(Profession::Router),
            other => Err(format!("unknown profession {:?}", other)),
        }
    }
}

/// Parsed `<vendor>:<product>:<profession>_<kind>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverKey {
    pub vendor: String,
    pub product: String,
    pub profession: Profession,
    pub kind: String,
}

impl DriverKey {
    /// Key of a built-in driver.
    pub fn builtin(profession: Profession, kind: &str) -> Self {
        Self {
            vendor: BUILTIN_VENDOR.to_string(),
            product: BUILTIN_PRODUCT.to_string(),
            profession,
            kind: kind.to_string(),
        }
    }
}

impl fmt::Display for DriverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}_{}",
            self.vendor, self.product, self.profession, self.kind
        )
    }
}

impl FromStr for DriverKey {
    type Err = DriverError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DriverError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = key.split(':').collect();
        let [vendor, product, tail] = parts.as_slice() else {
            return Err(invalid("expected <vendor>:<product>:<profession>_<kind>"));
        };
        if vendor.is_empty() || product.is_empty() {
            return Err(invalid("empty vendor or product"));
        }
        let (profession, kind) = tail
            .split_once('_')
            .ok_or_else(|| invalid("missing _<kind>"))?;
        if kind.is_empty() {
            return Err(invalid("empty kind"));
        }
        let profession = profession.parse::<Profession>().map_err(|e| invalid(&e))?;

        Ok(Self {
            vendor: vendor.to_string(),
            product: product.to_string(),
            profession,
            kind: kind.to_string(),
        })
    }
}

/// A configured driver instance.
#[derive(Clone)]
pub enum Driver {
    Auth(Arc<dyn Filter>),
    Discovery(Arc<dyn Discovery>),
    Output(Arc<dyn CompleteHandler>),
    Router(Arc<dyn Filter>),
}

impl Driver {
    pub fn profession(&self) -> Profession {
        match self {
            Driver::Auth(_) => Profession::Auth,
            Driver::Discovery(_) => Profession::Discovery,
            Driver::Output(_) => Profession::Output,
            Driver::Router(_) => Profession::Router,
        }
    }

    /// The chain link of an auth or router driver.
    pub fn as_filter(&self) -> Option<Arc<dyn Filter>> {
        match self {
            Driver::Auth(f) | Driver::Router(f) => Some(f.clone()),
            _ => None,
        }
    }

    pub fn as_discovery(&self) -> Option<Arc<dyn Discovery>> {
        match self {
            Driver::Discovery(d) => Some(d.clone()),
            _ => None,
        }
    }

    pub fn as_output(&self) -> Option<Arc<dyn CompleteHandler>> {
        match self {
            Driver::Output(o) => Some(o.clone()),
            _ => None,
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Driver::{}", self.profession())
    }
}

/// Identity a driver instance is created with.
#[derive(Debug, Clone, Default)]
pub struct DriverInfo {
    pub profession: String,
    pub name: String,
    pub label: String,
    pub desc: String,
}

/// Builds driver instances from string parameters.
pub trait DriverFactory: Send + Sync {
    fn create(
        &self,
        profession: &str,
        name: &str,
        label: &str,
        desc: &str,
        params: &HashMap<String, String>,
    ) -> Result<Driver, DriverError>;
}

/// Factory whose config type `C` is fixed at compile time.
pub struct TypedFactory<C, F> {
    build: F,
    _config: PhantomData<fn() -> C>,
}

impl<C, F> TypedFactory<C, F>
where
    C: DeserializeOwned,
    F: Fn(&DriverInfo, C) -> Result<Driver, DriverError> + Send + Sync,
{
    pub fn new(build: F) -> Self {
        Self {
            build,
            _config: PhantomData,
        }
    }
}

impl<C, F> DriverFactory for TypedFactory<C, F>
where
    C: DeserializeOwned,
    F: Fn(&DriverInfo, C) -> Result<Driver, DriverError> + Send + Sync,
{
    fn create(
        &self,
        profession: &str,
        name: &str,
        label: &str,
        desc: &str,
        params: &HashMap<String, String>,
    ) -> Result<Driver, DriverError> {
        let config: C = params::decode(name, params)?;
        let info = DriverInfo {
            profession: profession.to_string(),
            name: name.to_string(),
            label: label.to_string(),
            desc: desc.to_string(),
        };
        (self.build)(&info, config)
    }
}

/// Register every built-in driver.
pub fn register_builtin(registry: &DriverRegistry) -> Result<(), DriverError> {
    discovery_static::register(registry)?;
    auth_apikey::register(registry)?;
    output_access_log::register(registry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        let key: DriverKey = "eolinker:goku:auth_aksk".parse().unwrap();
        assert_eq!(key.vendor, "eolinker");
        assert_eq!(key.product, "goku");
        assert_eq!(key.profession, Profession::Auth);
        assert_eq!(key.kind, "aksk");
        assert_eq!(key.to_string(), "eolinker:goku:auth_aksk");
    }

    #[test]
    fn test_kind_may_contain_underscores() {
        let key: DriverKey = "edge:gateway:output_access_log".parse().unwrap();
        assert_eq!(key.profession, Profession::Output);
        assert_eq!(key.kind, "access_log");
    }

    #[test]
    fn test_reject_malformed_keys() {
        for key in [
            "",
            "edge:gateway",
            "edge:gateway:auth",
            "edge:gateway:auth_",
            ":gateway:auth_x",
            "edge:gateway:billing_x",
            "a:b:c:auth_x",
        ] {
            assert!(
                matches!(key.parse::<DriverKey>(), Err(DriverError::InvalidKey { .. })),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_builtin_key_roundtrip() {
        let key = DriverKey::builtin(Profession::Discovery, "static");
        assert_eq!(key.to_string(), "edge:gateway:discovery_static");
        assert_eq!(key.to_string().parse::<DriverKey>().unwrap(), key);
    }
}

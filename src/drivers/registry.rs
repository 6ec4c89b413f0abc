//! Driver registry.
//!
//! # Responsibilities
//! - Map driver keys to factories, rejecting duplicates
//! - Create configured driver instances by key
//! - Check that a factory produced the profession its key names

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::drivers::{Driver, DriverError, DriverFactory, DriverKey};

struct Registration {
    key: DriverKey,
    factory: Arc<dyn DriverFactory>,
}

/// Process-wide table of driver factories.
#[derive(Default)]
pub struct DriverRegistry {
    factories: DashMap<String, Registration>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `key`. A second registration of the same
    /// key fails and leaves the first in place.
    pub fn register(&self, key: &str, factory: Arc<dyn DriverFactory>) -> Result<(), DriverError> {
        let parsed: DriverKey = key.parse()?;
        match self.factories.entry(key.to_string()) {
            Entry::Occupied(_) => Err(DriverError::Duplicate(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Registration {
                    key: parsed,
                    factory,
                });
                tracing::debug!(driver = %key, "Driver registered");
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.get(key).map(|r| r.factory.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Create a driver instance from the factory registered under `key`.
    pub fn create(
        &self,
        key: &str,
        name: &str,
        label: &str,
        desc: &str,
        params: &HashMap<String, String>,
    ) -> Result<Driver, DriverError> {
        let (expected, factory) = {
            let entry = self
                .factories
                .get(key)
                .ok_or_else(|| DriverError::NotFound(key.to_string()))?;
            (entry.key.profession, entry.factory.clone())
        };

        let driver = factory.create(key, name, label, desc, params)?;
        if driver.profession() != expected {
            return Err(DriverError::ProfessionMismatch {
                key: key.to_string(),
                expected,
                actual: driver.profession(),
            });
        }
        tracing::info!(driver = %key, name = %name, "Driver created");
        Ok(driver)
    }
}

//! API key authentication.

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use subtle::{Choice, ConstantTimeEq};

use crate::chain::{ChainError, Filter, Next};
use crate::context::{EoContext, ErrorFinisher};
use crate::drivers::params::{comma_list, from_text, lenient_string};
use crate::drivers::{Driver, DriverError, DriverInfo, DriverKey, DriverRegistry, Profession, TypedFactory};

pub const KIND: &str = "apikey";

#[derive(Debug, Deserialize)]
pub struct ApiKeyConfig {
    /// Header carrying the key. `authorization` also accepts `Bearer <key>`.
    #[serde(default = "default_header", deserialize_with = "lenient_string")]
    pub header: String,

    #[serde(deserialize_with = "comma_list")]
    pub keys: Vec<String>,

    /// Strip the credential before proxying.
    #[serde(default, deserialize_with = "from_text")]
    pub hide_credential: bool,
}

fn default_header() -> String {
    "x-api-key".to_string()
}

/// Rejects requests that do not present a known key.
pub struct ApiKeyAuth {
    name: String,
    header: String,
    keys: Vec<String>,
    hide_credential: bool,
}

impl ApiKeyAuth {
    pub fn new(name: &str, config: ApiKeyConfig) -> Result<Self, DriverError> {
        if config.keys.is_empty() {
            return Err(DriverError::InvalidParams {
                driver: name.to_string(),
                reason: "keys must not be empty".to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            header: config.header.to_ascii_lowercase(),
            keys: config
                .keys
                .into_iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            hide_credential: config.hide_credential,
        })
    }

    fn presented<'a>(&self, ctx: &'a dyn EoContext) -> Option<&'a str> {
        let value = ctx.request().header(&self.header)?.trim();
        if self.header == "authorization" {
            return value.strip_prefix("Bearer ").map(str::trim);
        }
        Some(value)
    }

    /// Compares against every configured key in constant time per key.
    fn is_known(&self, presented: &str) -> bool {
        let found = self
            .keys
            .iter()
            .fold(Choice::from(0), |found, key| {
                found | key.as_bytes().ct_eq(presented.as_bytes())
            });
        found.into()
    }
}

#[async_trait]
impl Filter for ApiKeyAuth {
    async fn do_filter(&self, ctx: &mut dyn EoContext, next: Next<'_>) -> Result<(), ChainError> {
        let accepted = self
            .presented(&*ctx)
            .map(|key| self.is_known(key))
            .unwrap_or(false);

        if !accepted {
            ctx.set_finish_handler(Arc::new(ErrorFinisher::new(
                StatusCode::UNAUTHORIZED,
                "invalid api key",
            )));
            return Err(ChainError::Rejected {
                filter: self.name.clone(),
                reason: format!("missing or unknown key in {}", self.header),
            });
        }

        if self.hide_credential {
            ctx.proxy_mut().remove_header(&self.header);
        }
        next.run(ctx).await
    }
}

pub fn register(registry: &DriverRegistry) -> Result<(), DriverError> {
    let key = DriverKey::builtin(Profession::Auth, KIND).to_string();
    registry.register(
        &key,
        Arc::new(TypedFactory::new(|info: &DriverInfo, config: ApiKeyConfig| {
            Ok(Driver::Auth(Arc::new(ApiKeyAuth::new(&info.name, config)?)))
        })),
    )
}

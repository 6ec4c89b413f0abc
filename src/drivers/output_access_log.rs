//! Access log output: one structured event per finished request.

use serde::Deserialize;
use std::sync::Arc;

use crate::context::{CompleteHandler, FinishedRequest, LABEL_API, LABEL_SERVICE};
use crate::drivers::params::{from_text, lenient_string};
use crate::drivers::{Driver, DriverError, DriverInfo, DriverKey, DriverRegistry, Profession, TypedFactory};

pub const KIND: &str = "access_log";

#[derive(Debug, Deserialize)]
pub struct AccessLogConfig {
    /// `info`, `debug` or `warn`.
    #[serde(default = "default_level", deserialize_with = "lenient_string")]
    pub level: String,

    /// Also log every proxy attempt.
    #[serde(default, deserialize_with = "from_text")]
    pub include_proxies: bool,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warn,
}

pub struct AccessLog {
    name: String,
    level: Level,
    include_proxies: bool,
}

impl AccessLog {
    pub fn new(name: &str, config: AccessLogConfig) -> Result<Self, DriverError> {
        let level = match config.level.to_ascii_lowercase().as_str() {
            "debug" => Level::Debug,
            "info" => Level::Info,
            "warn" => Level::Warn,
            other => {
                return Err(DriverError::InvalidParams {
                    driver: name.to_string(),
                    reason: format!("unsupported level {:?}", other),
                })
            }
        };
        Ok(Self {
            name: name.to_string(),
            level,
            include_proxies: config.include_proxies,
        })
    }
}

macro_rules! access_event {
    ($level:ident, $output:expr, $f:expr) => {
        tracing::$level!(
            target: "gateway::access",
            output = %$output,
            request_id = %$f.request_id,
            kind = %$f.kind,
            port = $f.port,
            method = %$f.method,
            uri = %$f.uri,
            host = %$f.host,
            client_ip = %$f.client_ip,
            status = $f.status,
            grpc_status = $f.grpc_status.as_deref().unwrap_or(""),
            api = $f.labels.get(LABEL_API).map(String::as_str).unwrap_or(""),
            service = $f.labels.get(LABEL_SERVICE).map(String::as_str).unwrap_or(""),
            attempts = $f.proxies.len(),
            request_bytes = $f.request_bytes,
            elapsed_ms = $f.elapsed.as_millis() as u64,
            error = $f.error.as_deref().unwrap_or(""),
            "access"
        )
    };
}

impl CompleteHandler for AccessLog {
    fn complete(&self, finished: &FinishedRequest) {
        match self.level {
            Level::Debug => access_event!(debug, self.name, finished),
            Level::Info => access_event!(info, self.name, finished),
            Level::Warn => access_event!(warn, self.name, finished),
        }

        if self.include_proxies {
            for (attempt, record) in finished.proxies.iter().enumerate() {
                tracing::debug!(
                    target: "gateway::access",
                    request_id = %finished.request_id,
                    attempt = attempt + 1,
                    target_addr = %record.target,
                    host = %record.host_header,
                    status = record.status.unwrap_or(0),
                    elapsed_ms = record.elapsed.map(|d| d.as_millis() as u64).unwrap_or(0),
                    error = record.error.as_deref().unwrap_or(""),
                    "proxy attempt"
                );
            }
        }
    }
}

pub fn register(registry: &DriverRegistry) -> Result<(), DriverError> {
    let key = DriverKey::builtin(Profession::Output, KIND).to_string();
    registry.register(
        &key,
        Arc::new(TypedFactory::new(|info: &DriverInfo, config: AccessLogConfig| {
            Ok(Driver::Output(Arc::new(AccessLog::new(&info.name, config)?)))
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_level_parsing() {
        let ok = AccessLog::new("log", AccessLogConfig {
            level: "WARN".into(),
            include_proxies: false,
        })
        .unwrap();
        assert_eq!(ok.level, Level::Warn);

        assert!(AccessLog::new("log", AccessLogConfig {
            level: "trace".into(),
            include_proxies: false,
        })
        .is_err());
    }

    #[test]
    fn test_registered_as_output() {
        let registry = DriverRegistry::new();
        register(&registry).unwrap();
        let driver = registry
            .create("edge:gateway:output_access_log", "log", "", "", &HashMap::new())
            .unwrap();
        assert_eq!(driver.profession(), Profession::Output);
        assert!(driver.as_output().is_some());
    }
}

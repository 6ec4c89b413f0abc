//! TLS termination with SNI certificate selection.
//!
//! # Responsibilities
//! - Parse certificate material into a per-port `Certs` store
//! - Select a certificate by SNI host during the handshake
//! - Swap a port's store atomically when its routes change
//!
//! # Design Decisions
//! - Malformed material fails at construction, never at lookup
//! - Lookup is case-insensitive: exact host first, then `*.parent`
//! - No default certificate: an unknown SNI host fails the handshake
//! - Handshakes already holding the old store keep it until they finish

use arc_swap::ArcSwap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no certificate for host {0:?}")]
    NotFound(String),

    #[error("no certificates configured")]
    NoCertificates,

    #[error("invalid certificate for {host}: {reason}")]
    InvalidCertificate { host: String, reason: String },

    #[error("tls config: {0}")]
    Config(#[from] rustls::Error),
}

/// Certificate material for one host name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CertificateConfig {
    Pem { cert_pem: String, key_pem: String },
    Files { cert_path: PathBuf, key_path: PathBuf },
}

impl CertificateConfig {
    fn load(&self, host: &str) -> Result<CertifiedKey, TlsError> {
        let invalid = |reason: String| TlsError::InvalidCertificate {
            host: host.to_string(),
            reason,
        };

        let (cert_pem, key_pem) = match self {
            CertificateConfig::Pem { cert_pem, key_pem } => (cert_pem.clone(), key_pem.clone()),
            CertificateConfig::Files {
                cert_path,
                key_path,
            } => (
                std::fs::read_to_string(cert_path)
                    .map_err(|e| invalid(format!("{}: {}", cert_path.display(), e)))?,
                std::fs::read_to_string(key_path)
                    .map_err(|e| invalid(format!("{}: {}", key_path.display(), e)))?,
            ),
        };

        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| invalid(format!("certificate pem: {}", e)))?;
        if chain.is_empty() {
            return Err(invalid("no certificate in pem".to_string()));
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| invalid(format!("key pem: {}", e)))?
            .ok_or_else(|| invalid("no private key in pem".to_string()))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| invalid(format!("private key: {}", e)))?;

        Ok(CertifiedKey::new(chain, signing_key))
    }
}

/// Host name to certificate table for one port.
#[derive(Debug, Default)]
pub struct Certs {
    certs: HashMap<String, Arc<CertifiedKey>>,
}

impl Certs {
    /// Build the store, failing on the first malformed entry.
    pub fn new(config: &HashMap<String, CertificateConfig>) -> Result<Self, TlsError> {
        let mut certs = HashMap::with_capacity(config.len());
        for (host, material) in config {
            let key = material.load(host)?;
            certs.insert(host.trim().to_ascii_lowercase(), Arc::new(key));
        }
        Ok(Self { certs })
    }

    /// Certificate for `host`: exact match, then the `*.parent` wildcard.
    pub fn get(&self, host: &str) -> Result<Arc<CertifiedKey>, TlsError> {
        if self.certs.is_empty() {
            return Err(TlsError::NoCertificates);
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(cert) = self.certs.get(&host) {
            return Ok(cert.clone());
        }
        if let Some((_, parent)) = host.split_once('.') {
            if let Some(cert) = self.certs.get(&format!("*.{}", parent)) {
                return Ok(cert.clone());
            }
        }
        Err(TlsError::NotFound(host))
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.certs.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

/// SNI certificate resolver backed by a swappable `Certs`.
#[derive(Debug)]
pub struct SniResolver {
    port: u16,
    certs: ArcSwap<Certs>,
}

impl SniResolver {
    pub fn new(port: u16, certs: Certs) -> Self {
        Self {
            port,
            certs: ArcSwap::from_pointee(certs),
        }
    }

    /// Replace the store. Readers that loaded the old one keep it.
    pub fn swap(&self, certs: Certs) {
        let hosts = certs.len();
        self.certs.store(Arc::new(certs));
        tracing::info!(port = self.port, hosts, "Certificate store swapped");
    }

    pub fn current(&self) -> Arc<Certs> {
        self.certs.load_full()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            tracing::debug!(port = self.port, "TLS handshake without SNI");
            metrics::record_tls_handshake_failure("no_sni");
            return None;
        };

        match self.certs.load().get(name) {
            Ok(cert) => Some(cert),
            Err(e) => {
                tracing::debug!(port = self.port, server_name = %name, error = %e, "No certificate for SNI host");
                metrics::record_tls_handshake_failure("no_certificate");
                None
            }
        }
    }
}

/// Acceptor using `resolver`, advertising h2 and http/1.1.
pub fn acceptor(resolver: Arc<SniResolver>) -> Result<TlsAcceptor, TlsError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

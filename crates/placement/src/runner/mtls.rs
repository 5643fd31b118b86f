//! Secure channel construction for runner clients
//!
//! This is the only place that holds certificate and key material. Pools
//! receive a [`RunnerFactory`] and treat the runners it builds as opaque
//! capabilities.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, instrument};

use super::{GrpcRunner, Runner};

/// Default time allowed for connecting (and the TLS handshake)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runner client construction errors
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("invalid runner address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("invalid TLS configuration for {address}: {source}")]
    Tls {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// Connection or handshake (including peer identity check) failed
    #[error("failed to connect to runner {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("timed out connecting to runner {address} after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    /// Reading PKI material failed
    #[error("failed to read PKI material: {0}")]
    Io(#[from] std::io::Error),
}

/// CA bundle, private key and certificate, PEM encoded
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiData {
    pub ca: String,
    pub key: String,
    pub cert: String,
}

impl std::fmt::Debug for PkiData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkiData")
            .field("ca", &format_args!("<{} bytes>", self.ca.len()))
            .field("key", &"<redacted>")
            .field("cert", &format_args!("<{} bytes>", self.cert.len()))
            .finish()
    }
}

impl PkiData {
    pub fn new(ca: impl Into<String>, key: impl Into<String>, cert: impl Into<String>) -> Self {
        Self {
            ca: ca.into(),
            key: key.into(),
            cert: cert.into(),
        }
    }

    /// Load PEM files from disk
    pub async fn from_files(
        ca: impl AsRef<Path>,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<Self, FactoryError> {
        Ok(Self {
            ca: tokio::fs::read_to_string(ca).await?,
            cert: tokio::fs::read_to_string(cert).await?,
            key: tokio::fs::read_to_string(key).await?,
        })
    }

    fn tls_config(&self, cert_common_name: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.ca))
            .identity(Identity::from_pem(&self.cert, &self.key))
            .domain_name(cert_common_name)
    }
}

/// Build a runner client over mutual TLS
///
/// The peer must present a certificate issued by `pki.ca` and valid for
/// `cert_common_name`. The handshake happens here, so identity failures are
/// construction errors rather than `try_exec` errors.
pub async fn build_mtls_runner(
    address: &str,
    cert_common_name: &str,
    pki: &PkiData,
) -> Result<GrpcRunner, FactoryError> {
    connect_mtls(address, cert_common_name, pki, DEFAULT_CONNECT_TIMEOUT).await
}

#[instrument(skip(pki), fields(%address, %cert_common_name))]
async fn connect_mtls(
    address: &str,
    cert_common_name: &str,
    pki: &PkiData,
    timeout: Duration,
) -> Result<GrpcRunner, FactoryError> {
    let endpoint = Endpoint::from_shared(format!("https://{}", address))
        .map_err(|source| FactoryError::InvalidAddress {
            address: address.to_string(),
            source,
        })?
        .tls_config(pki.tls_config(cert_common_name))
        .map_err(|source| FactoryError::Tls {
            address: address.to_string(),
            source,
        })?;

    connect(address, endpoint, timeout).await
}

async fn connect(
    address: &str,
    endpoint: Endpoint,
    timeout: Duration,
) -> Result<GrpcRunner, FactoryError> {
    let endpoint = endpoint.connect_timeout(timeout);
    let channel = tokio::time::timeout(timeout, endpoint.connect())
        .await
        .map_err(|_| FactoryError::ConnectTimeout {
            address: address.to_string(),
            timeout,
        })?
        .map_err(|source| FactoryError::Connect {
            address: address.to_string(),
            source,
        })?;

    debug!(%address, "Connected to runner");
    Ok(GrpcRunner::new(address, channel))
}

/// Builds runner clients for a pool
#[async_trait]
pub trait RunnerFactory: Send + Sync {
    /// Build a fully usable runner client for `address`
    async fn build(&self, address: &str) -> Result<Arc<dyn Runner>, FactoryError>;
}

/// Factory for mutually authenticated runner clients
#[derive(Debug, Clone)]
pub struct MtlsRunnerFactory {
    cert_common_name: String,
    pki: PkiData,
    connect_timeout: Duration,
}

impl MtlsRunnerFactory {
    pub fn new(cert_common_name: impl Into<String>, pki: PkiData) -> Self {
        Self {
            cert_common_name: cert_common_name.into(),
            pki,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl RunnerFactory for MtlsRunnerFactory {
    async fn build(&self, address: &str) -> Result<Arc<dyn Runner>, FactoryError> {
        let runner = connect_mtls(
            address,
            &self.cert_common_name,
            &self.pki,
            self.connect_timeout,
        )
        .await?;
        Ok(Arc::new(runner))
    }
}

/// Factory for plaintext runner clients (local development and tests)
#[derive(Debug, Clone)]
pub struct InsecureRunnerFactory {
    connect_timeout: Duration,
}

impl Default for InsecureRunnerFactory {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl InsecureRunnerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build a concrete plaintext client
    pub async fn connect(&self, address: &str) -> Result<GrpcRunner, FactoryError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", address)).map_err(|source| {
            FactoryError::InvalidAddress {
                address: address.to_string(),
                source,
            }
        })?;
        connect(address, endpoint, self.connect_timeout).await
    }
}

#[async_trait]
impl RunnerFactory for InsecureRunnerFactory {
    async fn build(&self, address: &str) -> Result<Arc<dyn Runner>, FactoryError> {
        Ok(Arc::new(self.connect(address).await?))
    }
}

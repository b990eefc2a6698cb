//! Certificate manager for TLS termination
//!
//! Resolves a rustls `ServerConfig` per SNI hostname. Certificate bundles are
//! persisted through a [`CertCache`]; on a cache miss a bundle is issued for
//! provisioned hostnames only (a hostname is provisioned when it has a domain
//! mapping, or is on the extra allow-list).
//!
//! Bundles are PEM: the private key followed by the certificate chain.

use crate::certcache::{CertCache, CertCacheError};
use crate::hostname::normalize_host;
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use rcgen::generate_simple_self_signed;
use rustls::ServerConfig;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as TokioMutex;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("client did not send a server name")]
    MissingServerName,

    #[error("hostname {0} is not provisioned")]
    HostNotAllowed(String),

    #[error("certificate bundle has no private key")]
    MissingKey,

    #[error("certificate bundle has no certificates")]
    MissingCertificate,

    #[error("certificate cache error: {0}")]
    Cache(#[from] CertCacheError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::RcgenError),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces certificate bundles for hostnames.
///
/// An ACME client plugs in here; the proxy only ever stores what it returns.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, hostname: &str) -> Result<Vec<u8>, CertificateError>;
}

/// Issues self-signed certificates with rcgen
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfSignedIssuer;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, hostname: &str) -> Result<Vec<u8>, CertificateError> {
        let cert = generate_simple_self_signed(vec![hostname.to_string()])?;

        let mut bundle = cert.serialize_private_key_pem();
        bundle.push_str(&cert.serialize_pem()?);

        info!("Generated self-signed certificate for: {}", hostname);

        Ok(bundle.into_bytes())
    }
}

/// Build a server config from a PEM bundle
pub fn server_config_from_bundle(bundle: &[u8]) -> Result<Arc<ServerConfig>, CertificateError> {
    let certs = rustls_pemfile::certs(&mut &bundle[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(CertificateError::MissingCertificate);
    }

    let key = rustls_pemfile::private_key(&mut &bundle[..])?.ok_or(CertificateError::MissingKey)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Certificate manager for handling TLS certificates
pub struct CertificateManager {
    cache: Arc<dyn CertCache>,
    store: Arc<dyn Store>,
    issuer: Arc<dyn CertificateIssuer>,
    extra_hosts: Vec<String>,
    configs: DashMap<String, Arc<ServerConfig>>,
    issue_lock: TokioMutex<()>,
}

impl CertificateManager {
    /// Create a new certificate manager
    ///
    /// `store` decides which hostnames are provisioned; `cache` holds the
    /// certificate bundles.
    pub fn new(
        cache: Arc<dyn CertCache>,
        store: Arc<dyn Store>,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        Self {
            cache,
            store,
            issuer,
            extra_hosts: Vec::new(),
            configs: DashMap::new(),
            issue_lock: TokioMutex::new(()),
        }
    }

    /// Also provision certificates for these hostnames (e.g. the admin API host)
    pub fn with_extra_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extra_hosts = hosts
            .into_iter()
            .filter_map(|h| normalize_host(h.as_ref()))
            .collect();
        self
    }

    /// Whether certificates may be issued for `hostname`
    pub async fn is_provisioned(&self, hostname: &str) -> Result<bool, CertificateError> {
        if self.extra_hosts.iter().any(|h| h == hostname) {
            return Ok(true);
        }
        Ok(self.store.get_domain(hostname).await?.is_some())
    }

    /// Server config for an SNI hostname, loading or issuing its certificate
    pub async fn server_config_for(
        &self,
        server_name: &str,
    ) -> Result<Arc<ServerConfig>, CertificateError> {
        let hostname =
            normalize_host(server_name).ok_or(CertificateError::MissingServerName)?;

        if let Some(config) = self.configs.get(&hostname) {
            return Ok(config.clone());
        }

        if let Some(config) = self.load(&hostname).await? {
            return Ok(config);
        }

        if !self.is_provisioned(&hostname).await? {
            return Err(CertificateError::HostNotAllowed(hostname));
        }

        let _guard = self.issue_lock.lock().await;

        // Another handshake may have issued while we waited
        if let Some(config) = self.load(&hostname).await? {
            return Ok(config);
        }

        let bundle = self.issuer.issue(&hostname).await?;
        let config = server_config_from_bundle(&bundle)?;
        self.cache.put(&hostname, &bundle).await?;
        self.configs.insert(hostname.clone(), config.clone());

        info!("Provisioned certificate for: {}", hostname);

        Ok(config)
    }

    /// Remove a hostname's stored certificate
    pub async fn remove(&self, hostname: &str) -> Result<(), CertificateError> {
        let hostname =
            normalize_host(hostname).ok_or(CertificateError::MissingServerName)?;
        self.configs.remove(&hostname);
        self.cache.delete(&hostname).await?;
        Ok(())
    }

    /// Run a TLS handshake, picking the certificate from the ClientHello's SNI.
    ///
    /// Returns the stream and the normalized server name.
    pub async fn accept<IO>(&self, stream: IO) -> Result<(TlsStream<IO>, String), CertificateError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;

        let server_name = match start.client_hello().server_name() {
            Some(name) => name.to_string(),
            None => {
                warn!("Rejecting TLS handshake without SNI");
                return Err(CertificateError::MissingServerName);
            }
        };

        let config = self.server_config_for(&server_name).await?;
        let stream = start.into_stream(config).await?;

        debug!("TLS handshake completed for {}", server_name);

        let hostname = normalize_host(&server_name).unwrap_or(server_name);
        Ok((stream, hostname))
    }

    async fn load(&self, hostname: &str) -> Result<Option<Arc<ServerConfig>>, CertificateError> {
        match self.cache.get(hostname).await {
            Ok(bundle) => {
                let config = server_config_from_bundle(&bundle)?;
                self.configs.insert(hostname.to_string(), config.clone());
                Ok(Some(config))
            }
            Err(CertCacheError::Miss) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

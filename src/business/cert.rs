//! TLS material for node inbounds
//!
//! `CertManager` caches the material of one node and decides when an
//! automated certificate is due for renewal. `DirCertProvider` is the bundled
//! issuer: it picks up files maintained by an external ACME client.

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::CertConfig;
use crate::core::{CertMethod, CertProvider, NodeId, NodeParams, TlsMaterial};
use crate::error::{ControllerError, Result};
use crate::logger::log;

/// Renew automated certificates this long before they expire
const RENEW_BEFORE_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

/// Decode the PEM chain and private key
pub fn parse_pem(
    material: &TlsMaterial,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut material.cert_pem.as_bytes())
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(ControllerError::Cert(
            "No certificates found in PEM".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut material.key_pem.as_bytes())
        .map_err(|e| ControllerError::Cert(format!("Invalid private key PEM: {}", e)))?
        .ok_or_else(|| ControllerError::Cert("No private key found".to_string()))?;

    Ok((certs, key))
}

/// Build a rustls server config from PEM material
pub fn build_server_config(material: &TlsMaterial) -> Result<Arc<ServerConfig>> {
    let (certs, key) = parse_pem(material)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ControllerError::Cert(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ControllerError::Cert(e.to_string()))?;

    // Session tickets let reconnecting clients skip the full handshake
    if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
        config.ticketer = ticketer;
    }

    Ok(Arc::new(config))
}

/// `notAfter` of the leaf certificate, `None` when it does not decode
pub fn leaf_expiry(cert_pem: &str) -> Option<SystemTime> {
    let der = rustls_pemfile::certs(&mut cert_pem.as_bytes()).next()?.ok()?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der).ok()?;
    let secs = cert.validity().not_after.timestamp();
    Some(if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    })
}

/// Read a certificate chain and key from disk
pub async fn load_material_files(cert_path: &Path, key_path: &Path) -> Result<TlsMaterial> {
    let cert_pem = tokio::fs::read_to_string(cert_path).await.map_err(|e| {
        ControllerError::Cert(format!("failed to read {}: {}", cert_path.display(), e))
    })?;
    let key_pem = tokio::fs::read_to_string(key_path).await.map_err(|e| {
        ControllerError::Cert(format!("failed to read {}: {}", key_path.display(), e))
    })?;
    let expires_at = leaf_expiry(&cert_pem);
    if expires_at.is_none() {
        log::debug!(cert = %cert_path.display(), "Certificate expiry not readable");
    }
    Ok(TlsMaterial {
        cert_pem,
        key_pem,
        expires_at,
    })
}

/// Certificates kept by an external ACME client as `<dir>/<domain>.crt` and
/// `<dir>/<domain>.key`
#[derive(Debug, Clone)]
pub struct DirCertProvider {
    dir: PathBuf,
}

impl DirCertProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn paths(&self, domain: &str) -> Result<(PathBuf, PathBuf)> {
        if domain.is_empty() || domain.contains(['/', '\\']) || domain.contains("..") {
            return Err(ControllerError::Cert(format!("invalid domain '{}'", domain)));
        }
        Ok((
            self.dir.join(format!("{}.crt", domain)),
            self.dir.join(format!("{}.key", domain)),
        ))
    }
}

#[async_trait]
impl CertProvider for DirCertProvider {
    async fn obtain_certificate(&self, domain: &str, method: CertMethod) -> Result<TlsMaterial> {
        let (cert_path, key_path) = self.paths(domain)?;
        log::debug!(
            domain = domain,
            method = %method,
            cert = %cert_path.display(),
            "Loading certificate from directory"
        );
        load_material_files(&cert_path, &key_path).await
    }
}

#[derive(Debug, Clone)]
struct CachedCert {
    material: TlsMaterial,
    obtained_at: Instant,
}

/// Per-node certificate cache
pub struct CertManager {
    node_id: NodeId,
    config: CertConfig,
    provider: Option<Arc<dyn CertProvider>>,
    cached: Mutex<Option<CachedCert>>,
}

impl CertManager {
    pub fn new(node_id: NodeId, config: CertConfig, provider: Option<Arc<dyn CertProvider>>) -> Self {
        Self {
            node_id,
            config,
            provider,
            cached: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<CachedCert> {
        self.cached.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn store(&self, material: TlsMaterial) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(CachedCert {
            material,
            obtained_at: Instant::now(),
        });
    }

    /// Domain to request, local override first
    pub fn domain<'a>(&'a self, params: &'a NodeParams) -> Option<&'a str> {
        self.config
            .domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .or_else(|| params.cert_domain())
    }

    /// Whether an automated certificate should be re-obtained now
    pub fn renewal_due(&self, params: &NodeParams) -> bool {
        if !params.tls || !self.config.mode.is_automated() {
            return false;
        }
        let Some(cached) = self.cached() else {
            return true;
        };
        if cached.obtained_at.elapsed() >= self.config.renew_interval {
            return true;
        }
        cached.material.expires_at.is_some_and(|expires| {
            expires
                .duration_since(SystemTime::now())
                .map(|left| left < RENEW_BEFORE_EXPIRY)
                .unwrap_or(true)
        })
    }

    /// Material to build the inbound with, `None` when the node has no TLS.
    ///
    /// Automated issuance falls back to the last-known-good certificate when
    /// the provider fails.
    pub async fn material(&self, params: &NodeParams) -> Result<Option<TlsMaterial>> {
        if !params.tls {
            return Ok(None);
        }

        match self.config.mode {
            CertMethod::None => Ok(None),
            CertMethod::File => {
                if let Some(cached) = self.cached() {
                    return Ok(Some(cached.material));
                }
                let (Some(cert), Some(key)) = (&self.config.cert_file, &self.config.key_file)
                else {
                    return Err(ControllerError::Cert(
                        "cert mode 'file' without cert_file/key_file".to_string(),
                    ));
                };
                let material = load_material_files(cert, key).await?;
                parse_pem(&material)?;
                self.store(material.clone());
                Ok(Some(material))
            }
            method => {
                if !self.renewal_due(params) {
                    return Ok(self.cached().map(|c| c.material));
                }
                match self.obtain(params, method).await {
                    Ok(material) => {
                        log::info!(node_id = self.node_id, method = %method, "Certificate obtained");
                        self.store(material.clone());
                        Ok(Some(material))
                    }
                    Err(e) => match self.cached() {
                        Some(cached) => {
                            log::warn!(
                                node_id = self.node_id,
                                error = %e,
                                "Certificate renewal failed, keeping current certificate"
                            );
                            Ok(Some(cached.material))
                        }
                        None => Err(e),
                    },
                }
            }
        }
    }

    async fn obtain(&self, params: &NodeParams, method: CertMethod) -> Result<TlsMaterial> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            ControllerError::Cert(format!("no certificate provider for mode '{}'", method))
        })?;
        let domain = self.domain(params).ok_or_else(|| {
            ControllerError::Cert("TLS node without server name or cert domain".to_string())
        })?;
        let material = provider.obtain_certificate(domain, method).await?;
        parse_pem(&material)?;
        Ok(material)
    }
}

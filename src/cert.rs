//! Certificate material for the node's own host name.
//!
//! The chain and key are read once at startup from PEM files and served
//! by the DoT listener through a fixed certificate resolver.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use tracing::debug;

/// The result type for certificate operations.
pub type CertResult<T> = Result<T, CertError>;

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
}

/// Loads a certificate chain and private key from PEM files.
pub fn load_certified_key(chain_path: &Path, key_path: &Path) -> CertResult<CertifiedKey> {
    let read_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| CertError::Read { path, source }
    };

    let mut chain_reader = BufReader::new(File::open(chain_path).map_err(read_err(chain_path))?);
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut chain_reader)
        .collect::<Result<_, _>>()
        .map_err(read_err(chain_path))?;
    if chain.is_empty() {
        return Err(CertError::NoCertificates(chain_path.to_path_buf()));
    }

    let mut key_reader = BufReader::new(File::open(key_path).map_err(read_err(key_path))?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(read_err(key_path))?
        .ok_or_else(|| CertError::NoPrivateKey(key_path.to_path_buf()))?;

    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key).map_err(CertError::SigningKey)?;

    debug!(
        "loaded certificate chain ({} certs) from {}",
        chain.len(),
        chain_path.display()
    );

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Builds a TLS server config that always presents `key`.
pub fn server_config(key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(key)));
    Arc::new(config)
}

/// Resolver that serves the node's single certificate regardless of SNI.
struct FixedCert(Arc<CertifiedKey>);

impl std::fmt::Debug for FixedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedCert").finish_non_exhaustive()
    }
}

impl rustls::server::ResolvesServerCert for FixedCert {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

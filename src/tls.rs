//! Certificate provision and TLS acceptor construction

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// A certificate chain and its private key
pub type CertifiedPair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse PEM from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("failed to generate self-signed certificate: {0}")]
    SelfSigned(String),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Supplies the certificate a listener presents
pub trait CertificateProvider: Send + Sync + fmt::Debug {
    fn certificate(&self) -> Result<CertifiedPair, TlsError>;
}

/// Certificate chain and key read from PEM files
#[derive(Debug, Clone)]
pub struct PemFiles {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl PemFiles {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

impl CertificateProvider for PemFiles {
    fn certificate(&self) -> Result<CertifiedPair, TlsError> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_key(&self.key_path)?;
        info!(
            cert = %self.cert_path.display(),
            key = %self.key_path.display(),
            "Loaded TLS certificate"
        );
        Ok((certs, key))
    }
}

/// A freshly generated self-signed certificate for the given names
#[derive(Debug, Clone)]
pub struct SelfSigned {
    names: Vec<String>,
}

impl SelfSigned {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

impl Default for SelfSigned {
    fn default() -> Self {
        Self::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
    }
}

impl CertificateProvider for SelfSigned {
    fn certificate(&self) -> Result<CertifiedPair, TlsError> {
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(self.names.clone())
            .map_err(|e| TlsError::SelfSigned(e.to_string()))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| TlsError::SelfSigned(e.to_string()))?;

        warn!(names = ?self.names, "Using self-signed certificate (not for production)");
        Ok((vec![cert_der], key_der))
    }
}

/// Build a rustls server configuration advertising HTTP/2 and HTTP/1.1
pub fn server_config(provider: &dyn CertificateProvider) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let (certs, key) = provider.certificate()?;

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

pub fn tls_acceptor(provider: &dyn CertificateProvider) -> Result<TlsAcceptor, TlsError> {
    Ok(TlsAcceptor::from(server_config(provider)?))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;

    loop {
        let item = rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        match item {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(TlsError::NoPrivateKey(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_self_signed_config() {
        let config = server_config(&SelfSigned::default()).unwrap();
        assert_eq!(config.alpn_protocols[0], b"h2");
    }

    #[test]
    fn test_pem_files() {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["proxy.test".to_string()]).unwrap();
        let cert_file = write_temp(&cert.pem());
        let key_file = write_temp(&key_pair.serialize_pem());

        let provider = PemFiles::new(cert_file.path(), key_file.path());
        let (certs, _key) = provider.certificate().unwrap();
        assert_eq!(certs.len(), 1);
        assert!(tls_acceptor(&provider).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let provider = PemFiles::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(provider.certificate(), Err(TlsError::Open { .. })));
    }

    #[test]
    fn test_empty_pem() {
        let empty = write_temp("");
        let provider = PemFiles::new(empty.path(), empty.path());
        assert!(matches!(provider.certificate(), Err(TlsError::NoCertificates(_))));
    }

    #[test]
    fn test_certificate_without_key() {
        let CertifiedKey { cert, .. } =
            generate_simple_self_signed(vec!["proxy.test".to_string()]).unwrap();
        let cert_file = write_temp(&cert.pem());

        let provider = PemFiles::new(cert_file.path(), cert_file.path());
        assert!(matches!(provider.certificate(), Err(TlsError::NoPrivateKey(_))));
    }
}

//! Server-side TLS configuration

use crate::config::BackendConfig;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Build a server configuration from a cert/key pair.
///
/// With a CA bundle, clients must present a certificate issued by it.
pub fn build_server_config(
    cert_path: &str,
    key_path: &str,
    ca_path: Option<&str>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let provider = crypto_provider();

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    let builder = match ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for ca in load_certs(ca_path)? {
                roots
                    .add(ca)
                    .map_err(|e| anyhow::anyhow!("Invalid CA certificate in {}: {}", ca_path, e))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to build client verifier: {}", e))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(Arc::new(config))
}

/// Acceptor for a backend, or `None` when it has no TLS material
pub fn acceptor_for(backend: &BackendConfig) -> anyhow::Result<Option<TlsAcceptor>> {
    let (Some(cert), Some(key)) = (backend.cert.as_deref(), backend.key.as_deref()) else {
        return Ok(None);
    };

    let config = build_server_config(cert, key, backend.ca.as_deref())?;
    info!(
        backend = %backend.name,
        cert,
        client_auth = backend.ca.is_some(),
        "TLS termination enabled"
    );
    Ok(Some(TlsAcceptor::from(config)))
}

pub fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

pub fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn self_signed() -> (NamedTempFile, NamedTempFile) {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (write_temp(&cert.pem()), write_temp(&key_pair.serialize_pem()))
    }

    #[test]
    fn test_build_server_config() {
        let (cert, key) = self_signed();
        let config = build_server_config(
            cert.path().to_str().unwrap(),
            key.path().to_str().unwrap(),
            None,
        );
        assert!(config.is_ok());
    }

    #[test]
    fn test_build_server_config_with_ca() {
        let (cert, key) = self_signed();
        // a self-signed cert doubles as its own CA
        let config = build_server_config(
            cert.path().to_str().unwrap(),
            key.path().to_str().unwrap(),
            Some(cert.path().to_str().unwrap()),
        );
        assert!(config.is_ok());
    }

    #[test]
    fn test_missing_files() {
        let err = build_server_config("/nonexistent/cert.pem", "/nonexistent/key.pem", None)
            .unwrap_err();
        assert!(err.to_string().contains("Failed to open certificate file"));
    }

    #[test]
    fn test_empty_pem() {
        let empty = write_temp("");
        let err = load_certs(empty.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("No certificates found"));

        let err = load_key(empty.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("No private key found"));
    }

    #[test]
    fn test_acceptor_for_plain_backend() {
        let backend = BackendConfig::tcp("plain", 9000, "127.0.0.1:9001".parse().unwrap());
        assert!(acceptor_for(&backend).unwrap().is_none());
    }
}

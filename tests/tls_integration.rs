//! Integration tests for TLS termination

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portgate::config::{BackendConfig, HostConfig};
use portgate::proxy::{Proxy, ProxyContext};
use portgate::resolver::ResolverRegistry;
use portgate::stats::MetricsRegistry;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

struct TestCert {
    der: CertificateDer<'static>,
    cert_file: NamedTempFile,
    key_file: NamedTempFile,
}

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn localhost_cert() -> TestCert {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    TestCert {
        der: cert.der().clone(),
        cert_file: write_temp(&cert.pem()),
        key_file: write_temp(&key_pair.serialize_pem()),
    }
}

fn connector(trusted: &CertificateDer<'static>) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(trusted.clone()).unwrap();
    let config = ClientConfig::builder_with_provider(portgate::tls::crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

fn context() -> ProxyContext {
    ProxyContext::new(
        Arc::new(HostConfig::default()),
        ResolverRegistry::with_static(),
        Arc::new(MetricsRegistry::new()),
    )
}

fn tls_backend(name: &str, destination: SocketAddr, cert: &TestCert) -> BackendConfig {
    let mut backend = BackendConfig::tcp(name, 0, destination)
        .with_listen_ip("127.0.0.1".parse().unwrap());
    backend.cert = Some(cert.cert_file.path().to_string_lossy().into_owned());
    backend.key = Some(cert.key_file.path().to_string_lossy().into_owned());
    backend
}

#[tokio::test]
async fn test_tls_terminated_before_backend() {
    let echo = echo_server().await;
    let cert = localhost_cert();
    let ctx = context();
    let proxy = Arc::new(Proxy::new(tls_backend("secure", echo, &cert), &ctx).unwrap());
    let addr = proxy.bind().await.unwrap();
    let server = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.start().await }
    });

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = connector(&cert.der)
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    tls.write_all(b"encrypted hello").await.unwrap();
    let mut buf = [0u8; 15];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"encrypted hello");

    // close_notify plus FIN ends the session cleanly
    tls.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let _ = tls.read_to_end(&mut rest).await;
    assert!(rest.is_empty());

    proxy.close().await;
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_client_certificate_required_with_ca() {
    let echo = echo_server().await;
    let cert = localhost_cert();
    let mut backend = tls_backend("mtls", echo, &cert);
    backend.ca = Some(cert.cert_file.path().to_string_lossy().into_owned());

    let ctx = context();
    let proxy = Arc::new(Proxy::new(backend, &ctx).unwrap());
    let addr = proxy.bind().await.unwrap();
    let server = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.start().await }
    });

    // no client certificate: the handshake or the first read fails
    let tcp = TcpStream::connect(addr).await.unwrap();
    if let Ok(mut tls) = connector(&cert.der)
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
    {
        let _ = tls.write_all(b"let me in").await;
        let mut buf = Vec::new();
        let read = tls.read_to_end(&mut buf).await;
        assert!(read.is_err() || buf.is_empty());
    }

    let errors = ctx.metrics.counter("mtls_tcp_errors");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while errors.get() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(errors.get(), 1);

    proxy.close().await;
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_plaintext_client_rejected_by_tls_backend() {
    let echo = echo_server().await;
    let cert = localhost_cert();
    let ctx = context();
    let proxy = Arc::new(Proxy::new(tls_backend("strict", echo, &cert), &ctx).unwrap());
    let addr = proxy.bind().await.unwrap();
    let server = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.start().await }
    });

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut reply = Vec::new();
    let _ = conn.read_to_end(&mut reply).await;
    assert!(!reply.starts_with(b"GET"));

    proxy.close().await;
    server.await.unwrap().unwrap();
}

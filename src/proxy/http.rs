//! HTTP proxying routed by the `Host` header
//!
//! Each request's host picks a configured domain; the domain's query is
//! resolved and the request is forwarded unmodified over a fresh backend
//! connection.

use super::ConnectionHandler;
use crate::config::{DomainConfig, Destination};
use crate::error::{ProxyError, ProxyResult};
use crate::resolver::ResolverRegistry;
use crate::stream::ProxyStream;
use async_trait::async_trait;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Serves HTTP on accepted connections
pub struct HttpHandler {
    router: Arc<Router>,
    tls: Option<TlsAcceptor>,
}

impl HttpHandler {
    pub fn new(
        domains: &HashMap<String, DomainConfig>,
        resolvers: ResolverRegistry,
        tls: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            router: Arc::new(Router::new(domains, resolvers)),
            tls,
        }
    }
}

#[async_trait]
impl ConnectionHandler for HttpHandler {
    async fn handle(&self, conn: TcpStream, peer: SocketAddr) -> ProxyResult<()> {
        let stream = ProxyStream::accept(conn, self.tls.as_ref())
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", peer, e)))?;

        let router = Arc::clone(&self.router);
        let service = service_fn(move |req: Request<Incoming>| {
            let router = Arc::clone(&router);
            async move { Ok::<_, Infallible>(router.route(req, peer).await) }
        });

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder.http1().preserve_header_case(true);
        builder
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(|e| ProxyError::Io(io::Error::new(io::ErrorKind::Other, e)))
    }
}

/// Maps request hosts to resolver queries
pub struct Router {
    domains: HashMap<String, Destination>,
    resolvers: ResolverRegistry,
}

impl Router {
    pub fn new(domains: &HashMap<String, DomainConfig>, resolvers: ResolverRegistry) -> Self {
        let domains = domains
            .iter()
            .map(|(host, domain)| {
                (
                    host.to_ascii_lowercase(),
                    Destination::Query {
                        resolver: domain.resolver.clone(),
                        query: domain.query.clone(),
                    },
                )
            })
            .collect();
        Self { domains, resolvers }
    }

    pub fn destination_for(&self, host: &str) -> Option<&Destination> {
        self.domains.get(&strip_port(host).to_ascii_lowercase())
    }

    async fn route(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let host = request_host(&req).unwrap_or_default();

        let Some(destination) = self.destination_for(&host) else {
            let err = ProxyError::UnknownDomain(host.clone());
            warn!(%peer, error = %err, "Rejecting request");
            return error_response(StatusCode::NOT_FOUND, "UNKNOWN_HOST", &err.to_string());
        };

        match self.forward(destination, req).await {
            Ok(response) => response.map(|body| body.boxed()),
            Err(e) => {
                warn!(%peer, host = %host, error = %e, "Failed to forward request");
                error_response(StatusCode::BAD_GATEWAY, "CONNECTION_FAILED", &e.to_string())
            }
        }
    }

    async fn forward(
        &self,
        destination: &Destination,
        req: Request<Incoming>,
    ) -> ProxyResult<Response<Incoming>> {
        let addr = self.resolvers.resolve(destination).await?;
        let upstream = TcpStream::connect(addr)
            .await
            .map_err(|source| ProxyError::Dial { addr, source })?;
        let _ = upstream.set_nodelay(true);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(upstream))
            .await
            .map_err(|e| ProxyError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(backend = %addr, error = %e, "Backend connection error");
            }
        });

        sender
            .send_request(req)
            .await
            .map_err(|e| ProxyError::Io(io::Error::new(io::ErrorKind::Other, e)))
    }
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .map(str::to_string)
}

/// Drop a trailing `:port`, leaving bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "code": code,
        "message": message,
        "status": status.as_u16(),
    })
    .to_string();

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code)
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

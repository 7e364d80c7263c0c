//! Listeners and worker pools
//!
//! A `Proxy` is built once per backend and picks its variant from the
//! backend's protocol. TCP and HTTP share the stream listener: an accept loop
//! feeds a bounded queue that a fixed set of workers drains, one connection
//! per worker at a time. UDP runs a single relay session instead.

pub mod http;
mod transfer;
pub mod udp;

pub use transfer::{transfer, TransferStats};

use crate::config::{BackendConfig, Destination, HostConfig, Protocol};
use crate::error::{ProxyError, ProxyResult, ResolveError};
use crate::lifecycle::{EnvironmentRuntime, LifecycleManager};
use crate::resolver::ResolverRegistry;
use crate::stats::{BackendMetrics, MetricsRegistry};
use crate::stream::ProxyStream;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use self::http::HttpHandler;
use self::udp::UdpProxy;

/// Collaborators shared by every proxy in the process
#[derive(Clone)]
pub struct ProxyContext {
    pub host: Arc<HostConfig>,
    pub resolvers: ResolverRegistry,
    pub metrics: Arc<MetricsRegistry>,
    pub runtime: Option<Arc<dyn EnvironmentRuntime>>,
}

impl ProxyContext {
    pub fn new(host: Arc<HostConfig>, resolvers: ResolverRegistry, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            host,
            resolvers,
            metrics,
            runtime: None,
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn EnvironmentRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Lifecycle manager for a backend that declares a container
    fn lifecycle_for(&self, backend: &BackendConfig, metrics: &BackendMetrics) -> Option<Arc<LifecycleManager>> {
        let container = backend.container.as_deref()?;
        match &self.runtime {
            Some(runtime) => Some(Arc::new(LifecycleManager::new(
                container,
                Arc::clone(runtime),
                Arc::clone(&metrics.live),
                Arc::clone(&metrics.total),
            ))),
            None => {
                warn!(
                    backend = %backend.name,
                    container,
                    "Container configured but no environment runtime available"
                );
                None
            }
        }
    }
}

/// Source of inbound connections
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Per-connection work done by a worker once the environment is awake
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(&self, conn: TcpStream, peer: SocketAddr) -> ProxyResult<()>;
}

/// Relays raw bytes to the backend destination
pub struct TcpHandler {
    destination: Destination,
    resolvers: ResolverRegistry,
    tls: Option<TlsAcceptor>,
}

impl TcpHandler {
    pub fn new(destination: Destination, resolvers: ResolverRegistry, tls: Option<TlsAcceptor>) -> Self {
        Self {
            destination,
            resolvers,
            tls,
        }
    }
}

#[async_trait]
impl ConnectionHandler for TcpHandler {
    async fn handle(&self, conn: TcpStream, peer: SocketAddr) -> ProxyResult<()> {
        let addr = self.resolvers.resolve(&self.destination).await?;

        let upstream = TcpStream::connect(addr)
            .await
            .map_err(|source| ProxyError::Dial { addr, source })?;
        let _ = upstream.set_nodelay(true);

        let client = ProxyStream::accept(conn, self.tls.as_ref())
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", peer, e)))?;

        let tls = client.is_tls();
        let stats = transfer(client, upstream).await;
        debug!(
            %peer,
            backend = %addr,
            tls,
            sent = stats.client_to_backend,
            received = stats.backend_to_client,
            "Connection finished"
        );
        Ok(())
    }
}

/// A running (or runnable) proxy for one backend
pub enum Proxy {
    Tcp(StreamProxy),
    Http(StreamProxy),
    Udp(UdpProxy),
}

impl Proxy {
    /// Build the proxy variant for a backend.
    ///
    /// TLS material is loaded here so failures surface before anything binds.
    pub fn new(backend: BackendConfig, ctx: &ProxyContext) -> ProxyResult<Self> {
        let tls = crate::tls::acceptor_for(&backend).map_err(|e| ProxyError::Tls(format!("{:#}", e)))?;

        match backend.proto {
            Protocol::Tcp => {
                let destination = backend.destination().ok_or_else(|| {
                    ProxyError::Resolve(ResolveError::InvalidAddress(format!(
                        "backend '{}' has no destination",
                        backend.name
                    )))
                })?;
                let handler = TcpHandler::new(destination, ctx.resolvers.clone(), tls);
                Ok(Proxy::Tcp(StreamProxy::new(backend, Arc::new(handler), ctx)))
            }
            Protocol::Http => {
                let handler = HttpHandler::new(&ctx.host.domains, ctx.resolvers.clone(), tls);
                Ok(Proxy::Http(StreamProxy::new(backend, Arc::new(handler), ctx)))
            }
            Protocol::Udp => {
                if tls.is_some() {
                    return Err(ProxyError::UnsupportedProtocol("udp with tls".to_string()));
                }
                Ok(Proxy::Udp(UdpProxy::new(backend, ctx)?))
            }
        }
    }

    pub fn backend(&self) -> &BackendConfig {
        match self {
            Proxy::Tcp(p) | Proxy::Http(p) => p.backend(),
            Proxy::Udp(p) => p.backend(),
        }
    }

    /// Bind the listen address without serving yet
    pub async fn bind(&self) -> ProxyResult<SocketAddr> {
        match self {
            Proxy::Tcp(p) | Proxy::Http(p) => p.bind().await,
            Proxy::Udp(p) => p.bind().await,
        }
    }

    /// Bind if needed and serve until closed or the listener fails
    pub async fn start(&self) -> ProxyResult<()> {
        match self {
            Proxy::Tcp(p) | Proxy::Http(p) => p.start().await,
            Proxy::Udp(p) => p.start().await,
        }
    }

    /// Serve stream connections from a custom source
    pub async fn serve<A: Acceptor>(&self, acceptor: A) -> ProxyResult<()> {
        match self {
            Proxy::Tcp(p) | Proxy::Http(p) => p.serve(acceptor).await,
            Proxy::Udp(_) => Err(ProxyError::UnsupportedProtocol(
                "udp proxies do not accept streams".to_string(),
            )),
        }
    }

    /// Stop accepting and wait for in-flight work to drain
    pub async fn close(&self) {
        match self {
            Proxy::Tcp(p) | Proxy::Http(p) => p.close().await,
            Proxy::Udp(p) => p.close().await,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Proxy::Tcp(p) | Proxy::Http(p) => p.local_addr(),
            Proxy::Udp(p) => p.local_addr(),
        }
    }

    pub fn is_started(&self) -> bool {
        match self {
            Proxy::Tcp(p) | Proxy::Http(p) => p.is_started(),
            Proxy::Udp(p) => p.is_started(),
        }
    }
}

/// Accept loop plus worker pool for stream protocols
pub struct StreamProxy {
    backend: BackendConfig,
    handler: Arc<dyn ConnectionHandler>,
    ctx: ProxyContext,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

type Queue = Arc<AsyncMutex<mpsc::Receiver<(TcpStream, SocketAddr)>>>;

/// What a worker needs for each connection
struct Dispatch {
    name: String,
    handler: Arc<dyn ConnectionHandler>,
    metrics: BackendMetrics,
    lifecycle: Option<Arc<LifecycleManager>>,
}

impl StreamProxy {
    pub fn new(backend: BackendConfig, handler: Arc<dyn ConnectionHandler>, ctx: &ProxyContext) -> Self {
        Self {
            backend,
            handler,
            ctx: ctx.clone(),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            done: watch::channel(false).0,
        }
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub async fn bind(&self) -> ProxyResult<SocketAddr> {
        if self.is_started() || self.listener.lock().is_some() {
            return Err(ProxyError::AlreadyStarted);
        }
        let listener = self.bind_listener().await?;
        let local = listener.local_addr()?;
        *self.listener.lock() = Some(listener);
        Ok(local)
    }

    async fn bind_listener(&self) -> ProxyResult<TcpListener> {
        let addr = self.backend.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        *self.local_addr.lock() = Some(local);
        info!(
            backend = %self.backend.name,
            proto = %self.backend.proto,
            addr = %local,
            "Proxy listening"
        );
        Ok(listener)
    }

    fn mark_started(&self) -> ProxyResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ProxyError::AlreadyStarted);
        }
        Ok(())
    }

    pub async fn start(&self) -> ProxyResult<()> {
        self.mark_started()?;
        let bound = self.listener.lock().take();
        let listener = match bound {
            Some(listener) => listener,
            None => self.bind_listener().await?,
        };
        self.run(listener).await
    }

    /// Run the accept loop over any connection source.
    ///
    /// Returns once closed, or with `TooManyAcceptErrors` when the source
    /// keeps failing.
    pub async fn serve<A: Acceptor>(&self, acceptor: A) -> ProxyResult<()> {
        self.mark_started()?;
        self.run(acceptor).await
    }

    async fn run<A: Acceptor>(&self, mut acceptor: A) -> ProxyResult<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            self.done.send_replace(true);
            return Ok(());
        }

        let name = self.backend.name.clone();
        let metrics = self.ctx.metrics.backend(&name, self.backend.proto);
        let lifecycle = self.ctx.lifecycle_for(&self.backend, &metrics);
        let dispatch = Arc::new(Dispatch {
            name: name.clone(),
            handler: Arc::clone(&self.handler),
            metrics: metrics.clone(),
            lifecycle: lifecycle.clone(),
        });

        let (tx, rx) = mpsc::channel(self.backend.queue_capacity());
        let queue: Queue = Arc::new(AsyncMutex::new(rx));

        let workers: Vec<_> = (0..self.backend.workers())
            .map(|id| {
                tokio::spawn(worker_loop(id, Arc::clone(&dispatch), Arc::clone(&queue)))
            })
            .collect();

        let idle_check = lifecycle.map(|lifecycle| {
            tokio::spawn(lifecycle.run_idle_check(
                self.backend.idle_check_interval(),
                self.shutdown.subscribe(),
            ))
        });

        debug!(
            backend = %name,
            workers = workers.len(),
            queue = self.backend.queue_capacity(),
            "Worker pool started"
        );

        let max_errors = self.ctx.host.max_listen_errors;
        let mut consecutive_errors = 0usize;

        let result = loop {
            tokio::select! {
                accepted = acceptor.accept() => match accepted {
                    Ok((conn, peer)) => {
                        consecutive_errors = 0;
                        debug!(backend = %name, %peer, "Connection accepted");
                        // blocks while every worker is busy and the queue is full
                        if tx.send((conn, peer)).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors > max_errors {
                            error!(
                                backend = %name,
                                errors = consecutive_errors,
                                error = %e,
                                "Too many accept errors, closing listener"
                            );
                            break Err(ProxyError::TooManyAcceptErrors {
                                count: consecutive_errors,
                                source: e,
                            });
                        }
                        warn!(backend = %name, errors = consecutive_errors, error = %e, "Accept failed");
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!(backend = %name, "Proxy shutting down");
                    break Ok(());
                }
            }
        };

        // no further dispatch; workers serve what is queued, then exit
        drop(tx);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(backend = %name, error = %e, "Worker panicked");
            }
        }

        self.shutdown.send_replace(true);
        if let Some(idle_check) = idle_check {
            let _ = idle_check.await;
        }

        drop(acceptor);
        metrics.unregister(&self.ctx.metrics);
        self.done.send_replace(true);
        info!(backend = %name, "Proxy closed");

        result
    }

    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        // a bound but never served listener is simply dropped
        self.listener.lock().take();

        if !self.is_started() {
            return;
        }
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }
}

async fn worker_loop(id: usize, dispatch: Arc<Dispatch>, queue: Queue) {
    loop {
        // the lock is only held while waiting, never while serving
        let next = queue.lock().await.recv().await;
        let Some((conn, peer)) = next else {
            break;
        };
        dispatch.handle(conn, peer).await;
    }
    debug!(backend = %dispatch.name, worker = id, "Worker stopped");
}

impl Dispatch {
    async fn handle(&self, conn: TcpStream, peer: SocketAddr) {
        let started = Instant::now();
        self.metrics.connection_started();

        let result: ProxyResult<()> = async {
            if let Some(lifecycle) = &self.lifecycle {
                lifecycle.wake().await?;
            }
            self.handler.handle(conn, peer).await
        }
        .await;

        if let Err(e) = result {
            self.metrics.errors.inc();
            warn!(backend = %self.name, %peer, error = %e, "Connection failed");
        }
        self.metrics.connection_finished(started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn context() -> ProxyContext {
        ProxyContext::new(
            Arc::new(HostConfig::default()),
            ResolverRegistry::with_static(),
            Arc::new(MetricsRegistry::new()),
        )
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn backend_to(addr: SocketAddr) -> BackendConfig {
        BackendConfig::tcp("echo", 0, addr).with_listen_ip("127.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn test_tcp_proxy_round_trip() {
        let echo = echo_server().await;
        let ctx = context();
        let proxy = Arc::new(Proxy::new(backend_to(echo), &ctx).unwrap());
        let addr = proxy.bind().await.unwrap();

        let server = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.start().await }
        });

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"round trip").await.unwrap();
        conn.shutdown().await.unwrap();
        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"round trip");

        proxy.close().await;
        assert!(server.await.unwrap().is_ok());
        assert!(!ctx.metrics.contains("echo_tcp_live_connections"));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let echo = echo_server().await;
        let proxy = Arc::new(Proxy::new(backend_to(echo), &context()).unwrap());
        proxy.bind().await.unwrap();

        let server = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.start().await }
        });
        while !proxy.is_started() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(proxy.start().await, Err(ProxyError::AlreadyStarted)));

        proxy.close().await;
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dial_failure_is_per_connection() {
        // nothing listens on the destination
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = closed.local_addr().unwrap();
        drop(closed);

        let ctx = context();
        let proxy = Arc::new(Proxy::new(backend_to(dead), &ctx).unwrap());
        let addr = proxy.bind().await.unwrap();
        let server = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.start().await }
        });

        for _ in 0..2 {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).await.unwrap();
            assert!(buf.is_empty());
        }

        // the client sees EOF before the worker records the failure
        let errors = ctx.metrics.counter("echo_tcp_errors");
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while errors.get() < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(errors.get(), 2);

        proxy.close().await;
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let echo = echo_server().await;
        let proxy = Proxy::new(backend_to(echo), &context()).unwrap();
        proxy.bind().await.unwrap();
        proxy.close().await;
    }

    #[test]
    fn test_unreadable_tls_material_fails_construction() {
        let mut backend = backend_to("127.0.0.1:1".parse().unwrap());
        backend.cert = Some("/nonexistent/cert.pem".to_string());
        backend.key = Some("/nonexistent/key.pem".to_string());

        let err = Proxy::new(backend, &context()).err().unwrap();
        assert!(matches!(err, ProxyError::Tls(_)));
    }
}

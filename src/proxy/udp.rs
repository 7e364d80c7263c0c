//! UDP relay session
//!
//! One long-lived session per proxy. Datagrams from any client are forwarded
//! to the backend through a connected socket, and backend replies go to the
//! client that sent most recently. Each forwarded datagram counts as one
//! connection for metrics and idle checks.

use super::ProxyContext;
use crate::config::{BackendConfig, Destination};
use crate::error::{ProxyError, ProxyResult, ResolveError};
use crate::lifecycle::LifecycleManager;
use crate::stats::BackendMetrics;
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_DATAGRAM_SIZE: usize = 65_535;

pub struct UdpProxy {
    backend: BackendConfig,
    destination: Destination,
    ctx: ProxyContext,
    socket: Mutex<Option<UdpSocket>>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl UdpProxy {
    pub fn new(backend: BackendConfig, ctx: &ProxyContext) -> ProxyResult<Self> {
        let destination = backend.destination().ok_or_else(|| {
            ProxyError::Resolve(ResolveError::InvalidAddress(format!(
                "backend '{}' has no destination",
                backend.name
            )))
        })?;

        Ok(Self {
            backend,
            destination,
            ctx: ctx.clone(),
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            done: watch::channel(false).0,
        })
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
        if self.is_started() || self.socket.lock().is_some() {
            return Err(ProxyError::AlreadyStarted);
        }
        let socket = self.bind_socket().await?;
        let local = socket.local_addr()?;
        *self.socket.lock() = Some(socket);
        Ok(local)
    }

    async fn bind_socket(&self) -> ProxyResult<UdpSocket> {
        let addr = self.backend.listen_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local = socket.local_addr()?;

        *self.local_addr.lock() = Some(local);
        info!(backend = %self.backend.name, proto = "udp", addr = %local, "Proxy listening");
        Ok(socket)
    }

    pub async fn start(&self) -> ProxyResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ProxyError::AlreadyStarted);
        }
        let bound = self.socket.lock().take();
        let socket = match bound {
            Some(socket) => socket,
            None => self.bind_socket().await?,
        };
        self.run(socket).await;
        Ok(())
    }

    async fn run(&self, socket: UdpSocket) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            self.done.send_replace(true);
            return;
        }

        let name = self.backend.name.clone();
        let metrics = self.ctx.metrics.backend(&name, self.backend.proto);
        let lifecycle = self.ctx.lifecycle_for(&self.backend, &metrics);
        let idle_check = lifecycle.clone().map(|lifecycle| {
            tokio::spawn(lifecycle.run_idle_check(
                self.backend.idle_check_interval(),
                self.shutdown.subscribe(),
            ))
        });

        let mut session = Session {
            name: &name,
            destination: &self.destination,
            ctx: &self.ctx,
            metrics: &metrics,
            lifecycle: lifecycle.as_deref(),
            upstream: None,
        };
        let mut last_client: Option<SocketAddr> = None;
        let mut client_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut backend_buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut client_buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            debug!(backend = %name, error = %e, "Receive from client failed");
                            continue;
                        }
                    };
                    last_client = Some(peer);
                    session.forward(&client_buf[..len], peer).await;
                }
                received = recv_upstream(session.upstream.as_ref(), &mut backend_buf) => {
                    match received {
                        Ok(len) => {
                            let Some(peer) = last_client else { continue };
                            if let Err(e) = socket.send_to(&backend_buf[..len], peer).await {
                                debug!(backend = %name, %peer, error = %e, "Reply to client failed");
                            }
                        }
                        Err(e) => {
                            debug!(backend = %name, error = %e, "Receive from backend failed");
                            session.upstream = None;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!(backend = %name, "Proxy shutting down");
                    break;
                }
            }
        }

        drop(socket);
        self.shutdown.send_replace(true);
        if let Some(idle_check) = idle_check {
            let _ = idle_check.await;
        }
        metrics.unregister(&self.ctx.metrics);
        self.done.send_replace(true);
        info!(backend = %name, "Proxy closed");
    }

    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        self.socket.lock().take();

        if !self.is_started() {
            return;
        }
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }
}

struct Session<'a> {
    name: &'a str,
    destination: &'a Destination,
    ctx: &'a ProxyContext,
    metrics: &'a BackendMetrics,
    lifecycle: Option<&'a LifecycleManager>,
    upstream: Option<UdpSocket>,
}

impl Session<'_> {
    async fn forward(&mut self, datagram: &[u8], peer: SocketAddr) {
        let started = Instant::now();
        self.metrics.connection_started();

        if let Err(e) = self.try_forward(datagram).await {
            self.metrics.errors.inc();
            // re-resolve on the next datagram
            self.upstream = None;
            warn!(backend = %self.name, %peer, error = %e, "Datagram dropped");
        }
        self.metrics.connection_finished(started.elapsed());
    }

    async fn try_forward(&mut self, datagram: &[u8]) -> ProxyResult<()> {
        if let Some(lifecycle) = self.lifecycle {
            lifecycle.wake().await?;
        }

        if self.upstream.is_none() {
            let addr = self.ctx.resolvers.resolve(self.destination).await?;
            let bind_addr: SocketAddr = if addr.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let upstream = UdpSocket::bind(bind_addr).await?;
            upstream
                .connect(addr)
                .await
                .map_err(|source| ProxyError::Dial { addr, source })?;
            debug!(backend = %self.name, upstream = %addr, "Backend socket connected");
            self.upstream = Some(upstream);
        }

        if let Some(upstream) = &self.upstream {
            upstream.send(datagram).await?;
        }
        Ok(())
    }
}

async fn recv_upstream(upstream: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<usize> {
    match upstream {
        Some(socket) => socket.recv(buf).await,
        None => std::future::pending().await,
    }
}

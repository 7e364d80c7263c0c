//! Duplex stream over plain TCP or server-side TLS
//!
//! Both variants expose the same read/write surface, so the transfer engine
//! does not care whether TLS was terminated. `shutdown()` on the write side is
//! the half-close: for TLS it sends close_notify before closing the TCP write
//! direction.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pub enum ProxyStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ProxyStream {
    /// Wrap an accepted connection, running the TLS handshake when an acceptor is given
    pub async fn accept(conn: TcpStream, acceptor: Option<&TlsAcceptor>) -> io::Result<Self> {
        match acceptor {
            Some(acceptor) => {
                let tls = acceptor.accept(conn).await?;
                Ok(ProxyStream::Tls(Box::new(tls)))
            }
            None => Ok(ProxyStream::Plain(conn)),
        }
    }

    /// The raw transport underneath any TLS layer
    pub fn transport(&self) -> &TcpStream {
        match self {
            ProxyStream::Plain(s) => s,
            ProxyStream::Tls(s) => s.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.transport().peer_addr()
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ProxyStream::Tls(_))
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

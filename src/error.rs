//! Error types shared by resolvers and proxies

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while turning a query into a destination address
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid port in '{0}'")]
    InvalidPort(String),

    #[error("no backends found for '{query}'")]
    NoBackends { query: String },

    #[error("malformed answer for '{query}': {reason}")]
    InvalidAnswer { query: String, reason: String },

    #[error("dns exchange failed: {0}")]
    Dns(String),

    #[error("dns transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown resolver '{0}'")]
    UnknownResolver(String),

    #[error("resolver '{0}' is already registered")]
    DuplicateResolver(String),
}

/// Errors raised by listeners and workers
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy is already started")]
    AlreadyStarted,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("too many accept errors ({count}), last: {source}")]
    TooManyAcceptErrors {
        count: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to backend {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to wake environment: {0}")]
    Wake(#[source] anyhow::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),

    #[error("no domain configured for host '{0}'")]
    UnknownDomain(String),
}

impl ProxyError {
    /// Whether the error ends the whole listener rather than a single connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::AlreadyStarted
                | ProxyError::Bind { .. }
                | ProxyError::TooManyAcceptErrors { .. }
                | ProxyError::UnsupportedProtocol(_)
        )
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

//! Portgate - A TCP, UDP and HTTP reverse proxy with on-demand backends
//!
//! This library provides a multi-protocol proxy that:
//! - Relays TCP streams through a bounded worker pool per backend
//! - Terminates TLS (optionally requiring client certificates)
//! - Routes HTTP requests by Host header to resolver queries
//! - Relays UDP datagrams through a single session per backend
//! - Resolves destinations statically or through cached DNS SRV lookups
//! - Starts backend containers on first traffic and stops them when idle

pub mod admin;
pub mod config;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod stream;
pub mod tls;

//! Destination address resolution
//!
//! A `Resolver` turns a backend query into an address. Resolvers are looked
//! up by name in a `ResolverRegistry` that is built once at startup and handed
//! to every proxy.

mod srv;

pub use srv::{SrvCache, SrvResolver, GC_INTERVAL};

use crate::config::{Destination, SRV_RESOLVER, STATIC_RESOLVER};
use crate::error::ResolveError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A resolved destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverResult {
    pub ip: IpAddr,
    pub port: u16,
    /// Seconds the result may be reused for
    pub ttl: u32,
    /// When the result was obtained
    pub added: Instant,
}

impl ResolverResult {
    pub fn new(ip: IpAddr, port: u16, ttl: u32) -> Self {
        Self {
            ip,
            port,
            ttl,
            added: Instant::now(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// A result stops being valid once its full TTL has elapsed
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.added) >= Duration::from_secs(u64::from(self.ttl))
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<ResolverResult, ResolveError>;
}

/// Parses the query itself as a literal `ip:port`
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticResolver;

impl StaticResolver {
    pub fn parse(query: &str) -> Result<ResolverResult, ResolveError> {
        let (host, port) = query
            .rsplit_once(':')
            .ok_or_else(|| ResolveError::InvalidAddress(query.to_string()))?;

        let port: u16 = port
            .parse()
            .map_err(|_| ResolveError::InvalidPort(query.to_string()))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ResolveError::InvalidAddress(query.to_string()))?;

        Ok(ResolverResult::new(ip, port, 0))
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, query: &str) -> Result<ResolverResult, ResolveError> {
        Self::parse(query)
    }
}

/// Named resolvers available to proxies
#[derive(Default, Clone)]
pub struct ResolverRegistry {
    resolvers: Arc<DashMap<String, Arc<dyn Resolver>>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the static resolver
    pub fn with_static() -> Self {
        let registry = Self::new();
        registry.resolvers.insert(
            STATIC_RESOLVER.to_string(),
            Arc::new(StaticResolver) as Arc<dyn Resolver>,
        );
        registry
    }

    /// Register the SRV resolver for a DNS server and return its cache for collection
    pub fn register_srv(&self, server: SocketAddr) -> Result<Arc<SrvCache>, ResolveError> {
        let resolver = SrvResolver::new(server);
        let cache = resolver.cache();
        self.register(SRV_RESOLVER, Arc::new(resolver))?;
        Ok(cache)
    }

    /// Register a resolver under a name that must not be taken yet
    pub fn register(&self, name: &str, resolver: Arc<dyn Resolver>) -> Result<(), ResolveError> {
        match self.resolvers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ResolveError::DuplicateResolver(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(resolver);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Resolver>, ResolveError> {
        self.resolvers
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| ResolveError::UnknownResolver(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resolvers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve a backend destination to a socket address
    pub async fn resolve(&self, destination: &Destination) -> Result<SocketAddr, ResolveError> {
        match destination {
            Destination::Static(addr) => Ok(*addr),
            Destination::Query { resolver, query } => {
                let resolver = self.get(resolver)?;
                Ok(resolver.resolve(query).await?.addr())
            }
        }
    }
}

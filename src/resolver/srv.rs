//! DNS SRV resolver with a TTL cache
//!
//! Lookups check the cache under a read lock and mark entries whose TTL has
//! elapsed as inactive. Inactive entries are never returned and are only
//! removed by the periodic collector, which takes the write lock.

use super::{Resolver, ResolverResult};
use crate::error::ResolveError;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often the cache collector runs
pub const GC_INTERVAL: Duration = Duration::from_secs(180);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum UDP DNS response size with EDNS(0)
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

struct CacheEntry {
    result: ResolverResult,
    active: AtomicBool,
}

/// Query-keyed cache of SRV answers
#[derive(Default)]
pub struct SrvCache {
    entries: RwLock<HashMap<String, Vec<Arc<CacheEntry>>>>,
}

impl SrvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// First active, unexpired result for a query.
    ///
    /// Expired entries are flagged inactive on the way past.
    pub fn lookup(&self, query: &str, now: Instant) -> Option<ResolverResult> {
        let entries = self.entries.read();
        let results = entries.get(query)?;

        for entry in results {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            if entry.result.is_expired(now) {
                entry.active.store(false, Ordering::Release);
                continue;
            }
            return Some(entry.result.clone());
        }
        None
    }

    pub fn insert(&self, query: &str, results: Vec<ResolverResult>) {
        let mut entries = self.entries.write();
        entries
            .entry(query.to_string())
            .or_default()
            .extend(results.into_iter().map(|result| {
                Arc::new(CacheEntry {
                    result,
                    active: AtomicBool::new(true),
                })
            }));
    }

    /// Drop every inactive entry; returns how many were removed
    pub fn collect_garbage(&self) -> usize {
        let mut entries = self.entries.write();
        let mut removed = 0;

        for results in entries.values_mut() {
            let before = results.len();
            results.retain(|entry| entry.active.load(Ordering::Acquire));
            removed += before - results.len();
        }
        entries.retain(|_, results| !results.is_empty());

        removed
    }

    pub fn contains(&self, query: &str) -> bool {
        self.entries.read().contains_key(query)
    }

    /// Number of cached results (active or not) for a query
    pub fn entry_count(&self, query: &str) -> usize {
        self.entries.read().get(query).map_or(0, Vec::len)
    }

    pub fn inactive_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .flatten()
            .filter(|entry| !entry.active.load(Ordering::Acquire))
            .count()
    }

    /// Periodically collect garbage until shutdown
    pub async fn run_gc(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Resolver cache gc started");
                    let removed = self.collect_garbage();
                    debug!(removed, "Resolver cache gc finished");
                }
                _ = shutdown.changed() => {
                    debug!("Resolver cache gc stopping");
                    break;
                }
            }
        }
    }
}

/// Resolves queries through DNS SRV records
pub struct SrvResolver {
    server: SocketAddr,
    timeout: Duration,
    cache: Arc<SrvCache>,
}

impl SrvResolver {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: DEFAULT_TIMEOUT,
            cache: Arc::new(SrvCache::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache(&self) -> Arc<SrvCache> {
        Arc::clone(&self.cache)
    }

    async fn exchange(&self, query: &str) -> Result<Message, ResolveError> {
        let name = Name::from_str(query)
            .map_err(|e| ResolveError::Dns(format!("invalid name '{}': {}", query, e)))?;

        let id: u16 = rand::random();
        let mut request = Message::new();
        request
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, RecordType::SRV));
        let bytes = request
            .to_vec()
            .map_err(|e| ResolveError::Dns(format!("failed to encode query: {}", e)))?;

        let bind_addr: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.server).await?;
        socket.send(&bytes).await?;

        debug!(server = %self.server, query, "SRV query sent");

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        let receive = async {
            loop {
                let len = socket.recv(&mut buf).await?;
                let reply = Message::from_vec(&buf[..len])
                    .map_err(|e| ResolveError::Dns(format!("malformed response: {}", e)))?;
                if reply.id() != id {
                    warn!(expected = id, got = reply.id(), "Ignoring DNS response with mismatched id");
                    continue;
                }
                return Ok::<_, ResolveError>(reply);
            }
        };

        tokio::time::timeout(self.timeout, receive)
            .await
            .map_err(|_| {
                ResolveError::Dns(format!("timed out waiting for response from {}", self.server))
            })?
    }
}

#[async_trait]
impl Resolver for SrvResolver {
    async fn resolve(&self, query: &str) -> Result<ResolverResult, ResolveError> {
        if let Some(result) = self.cache.lookup(query, Instant::now()) {
            return Ok(result);
        }

        let reply = self.exchange(query).await?;
        let results = results_from_reply(query, &reply)?;
        let first = results[0].clone();
        debug!(query, addr = %first.addr(), ttl = first.ttl, answers = results.len(), "SRV query resolved");

        self.cache.insert(query, results);
        Ok(first)
    }
}

/// Pair each SRV answer with its address record.
///
/// Address records are matched by the SRV target name, falling back to the
/// additional record at the same position.
fn results_from_reply(query: &str, reply: &Message) -> Result<Vec<ResolverResult>, ResolveError> {
    let answers = reply.answers();
    if answers.is_empty() {
        return Err(ResolveError::NoBackends {
            query: query.to_string(),
        });
    }

    let additionals = reply.additionals();
    let mut results = Vec::with_capacity(answers.len());

    for (i, answer) in answers.iter().enumerate() {
        let Some(RData::SRV(srv)) = answer.data() else {
            continue;
        };

        let ip = additionals
            .iter()
            .filter(|record| record.name() == srv.target())
            .find_map(address_of)
            .or_else(|| additionals.get(i).and_then(address_of));

        if let Some(ip) = ip {
            results.push(ResolverResult::new(ip, srv.port(), answer.ttl()));
        }
    }

    if results.is_empty() {
        return Err(ResolveError::InvalidAnswer {
            query: query.to_string(),
            reason: "no SRV answer with a matching address record".to_string(),
        });
    }

    Ok(results)
}

fn address_of(record: &Record) -> Option<IpAddr> {
    match record.data()? {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

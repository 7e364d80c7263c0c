//! In-process metrics
//!
//! Named counters and timers live in a `MetricsRegistry` that is shared by
//! every proxy. Each backend registers its own set on start and removes it on
//! close; a reporter task periodically logs a snapshot.

use crate::config::Protocol;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// A signed atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Accumulated durations
#[derive(Debug, Default)]
pub struct Timer {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Timer {
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let count = self.count();
        let total = self.total_micros.load(Ordering::Relaxed);
        TimerSnapshot {
            count,
            mean_ms: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64 / 1000.0
            },
            max_ms: self.max_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimerSnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time view of every registered metric
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, i64>,
    pub timers: BTreeMap<String, TimerSnapshot>,
}

/// Registry of named metrics
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, Arc<Counter>>,
    timers: DashMap<String, Arc<Timer>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or register a counter
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.counters
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Get or register a timer
    pub fn timer(&self, name: &str) -> Arc<Timer> {
        self.timers
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn unregister(&self, name: &str) {
        self.counters.remove(name);
        self.timers.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.counters.contains_key(name) || self.timers.contains_key(name)
    }

    /// Register the per-backend metric set
    pub fn backend(&self, name: &str, proto: Protocol) -> BackendMetrics {
        let prefix = format!("{}_{}", name, proto);
        BackendMetrics {
            live: self.counter(&format!("{}_live_connections", prefix)),
            total: self.counter(&format!("{}_total_connections", prefix)),
            errors: self.counter(&format!("{}_errors", prefix)),
            proto_live: self.counter(&format!("{}_live_connections", proto)),
            requests: self.timer(&format!("{}_requests_timer", proto)),
            prefix,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().get()))
                .collect(),
            timers: self
                .timers
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
        }
    }

    /// Log a snapshot every `interval` until shutdown
    pub async fn run_reporter(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.snapshot();
                    for (name, value) in &snapshot.counters {
                        info!(metric = %name, value, "counter");
                    }
                    for (name, timer) in &snapshot.timers {
                        info!(
                            metric = %name,
                            count = timer.count,
                            mean_ms = timer.mean_ms,
                            max_ms = timer.max_ms,
                            "timer"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
    }
}

/// Counters owned by one running backend
#[derive(Debug, Clone)]
pub struct BackendMetrics {
    prefix: String,
    pub live: Arc<Counter>,
    pub total: Arc<Counter>,
    pub errors: Arc<Counter>,
    pub proto_live: Arc<Counter>,
    pub requests: Arc<Timer>,
}

impl BackendMetrics {
    /// Record a connection entering the worker
    pub fn connection_started(&self) {
        self.live.inc();
        self.total.inc();
        self.proto_live.inc();
    }

    /// Record a connection leaving the worker
    pub fn connection_finished(&self, elapsed: Duration) {
        self.live.dec();
        self.proto_live.dec();
        self.requests.record(elapsed);
    }

    /// Remove the backend-scoped metrics; protocol-wide ones are shared
    pub fn unregister(&self, registry: &MetricsRegistry) {
        for suffix in ["live_connections", "total_connections", "errors"] {
            registry.unregister(&format!("{}_{}", self.prefix, suffix));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::default();
        counter.inc();
        counter.inc();
        counter.dec();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn test_timer_snapshot() {
        let timer = Timer::default();
        assert_eq!(timer.snapshot().mean_ms, 0.0);

        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(30));

        let snap = timer.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.mean_ms, 20.0);
        assert_eq!(snap.max_ms, 30.0);
    }

    #[test]
    fn test_registration_returns_existing() {
        let registry = MetricsRegistry::new();
        let a = registry.counter("x");
        a.inc();
        let b = registry.counter("x");
        assert_eq!(b.get(), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_backend_metric_names() {
        let registry = MetricsRegistry::new();
        let metrics = registry.backend("redis", Protocol::Tcp);

        assert!(registry.contains("redis_tcp_live_connections"));
        assert!(registry.contains("redis_tcp_total_connections"));
        assert!(registry.contains("redis_tcp_errors"));
        assert!(registry.contains("tcp_live_connections"));
        assert!(registry.contains("tcp_requests_timer"));

        metrics.connection_started();
        assert_eq!(metrics.live.get(), 1);
        assert_eq!(metrics.total.get(), 1);
        metrics.connection_finished(Duration::from_millis(1));
        assert_eq!(metrics.live.get(), 0);
        assert_eq!(metrics.total.get(), 1);
        assert_eq!(metrics.requests.count(), 1);

        metrics.unregister(&registry);
        assert!(!registry.contains("redis_tcp_live_connections"));
        assert!(registry.contains("tcp_live_connections"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = MetricsRegistry::new();
        registry.counter("udp_live_connections").inc();
        let json = serde_json::to_string(&registry.snapshot()).unwrap();
        assert!(json.contains("\"udp_live_connections\":1"));
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let registry = Arc::new(MetricsRegistry::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(registry.run_reporter(Duration::from_millis(10), rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

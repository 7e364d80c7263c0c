//! On-demand execution environment lifecycle
//!
//! A backend with a container is `Dormant` until a connection needs it. The
//! first such connection starts it; racing connections wait on the same lock
//! and find it already running. An idle-check task stops the environment again
//! once a whole interval passes with no new connection and none in flight.

use crate::error::ProxyError;
use crate::stats::Counter;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pause after a successful start so the environment can come up
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Seconds the runtime waits for a graceful stop before killing
pub const STOP_GRACE_SECS: u64 = 10;

/// Something that can start and stop a named execution environment
#[async_trait]
pub trait EnvironmentRuntime: Send + Sync {
    async fn start(&self, id: &str) -> anyhow::Result<()>;
    async fn stop(&self, id: &str, grace_secs: u64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    Dormant,
    Running,
}

/// Wake/sleep state for one backend's environment
pub struct LifecycleManager {
    container: String,
    runtime: Arc<dyn EnvironmentRuntime>,
    /// Transition guard; held across the runtime call
    state: Mutex<EnvironmentState>,
    /// Lock-free mirror of `state` for the connection fast path
    running: AtomicBool,
    live: Arc<Counter>,
    total: Arc<Counter>,
    settle_delay: Duration,
}

impl LifecycleManager {
    pub fn new(
        container: &str,
        runtime: Arc<dyn EnvironmentRuntime>,
        live: Arc<Counter>,
        total: Arc<Counter>,
    ) -> Self {
        Self {
            container: container.to_string(),
            runtime,
            state: Mutex::new(EnvironmentState::Dormant),
            running: AtomicBool::new(false),
            live,
            total,
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn state(&self) -> EnvironmentState {
        if self.running.load(Ordering::Acquire) {
            EnvironmentState::Running
        } else {
            EnvironmentState::Dormant
        }
    }

    /// Make sure the environment is running before a connection proceeds
    pub async fn wake(&self) -> Result<(), ProxyError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if *state == EnvironmentState::Running {
            return Ok(());
        }

        info!(container = %self.container, "Starting environment");
        let started = Instant::now();
        self.runtime
            .start(&self.container)
            .await
            .map_err(ProxyError::Wake)?;

        tokio::time::sleep(self.settle_delay).await;
        *state = EnvironmentState::Running;
        self.running.store(true, Ordering::SeqCst);

        info!(
            container = %self.container,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Environment running"
        );
        Ok(())
    }

    /// One idle-check tick.
    ///
    /// Stops the environment when nothing arrived since `last_total` and no
    /// connection is live, then records the new sample. Returns whether a stop
    /// happened.
    pub async fn check_idle(&self, last_total: &mut i64) -> bool {
        let total = self.total.get();
        let mut stopped = false;

        if self.running.load(Ordering::SeqCst) && total == *last_total && self.live.get() == 0 {
            let mut state = self.state.lock().await;
            // clear the fast path first so new connections queue on the lock
            self.running.store(false, Ordering::SeqCst);
            if *state == EnvironmentState::Running
                && self.total.get() == total
                && self.live.get() == 0
            {
                *state = EnvironmentState::Dormant;
                info!(container = %self.container, "Environment idle, stopping");
                if let Err(e) = self.runtime.stop(&self.container, STOP_GRACE_SECS).await {
                    error!(container = %self.container, error = %e, "Failed to stop environment");
                }
                stopped = true;
            } else if *state == EnvironmentState::Running {
                self.running.store(true, Ordering::SeqCst);
            }
        }

        *last_total = total;
        stopped
    }

    /// Run idle checks every `interval` until shutdown
    pub async fn run_idle_check(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_total = self.total.get();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        debug!(
            container = %self.container,
            interval_secs = interval.as_secs_f64(),
            "Idle check started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_idle(&mut last_total).await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if self.running.load(Ordering::Acquire) {
            warn!(container = %self.container, "Idle check stopped while environment is running");
        }
    }
}

//! Scheduled loops and graceful shutdown.
//!
//! ```text
//!            ┌── persistence tick ── snapshot ──ok──► beat pulse
//! token ─────┼── heartbeat monitor ── reads pulse
//!            └── stuck-position escalator
//! ```
//!
//! The persistence tick beats the liveness pulse only after a snapshot is
//! written, so a wedged runtime or a persistence layer that keeps failing
//! both show up as a stale heartbeat.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::escalation::StuckPositionEscalator;
use crate::infrastructure::Container;
use crate::persistence::{SnapshotReceipt, StateStore};
use crate::pool::WorkerPool;
use crate::recovery::{HeartbeatMonitor, LivenessPulse};
use crate::state::TradingState;

/// Owns the background loops.
pub struct Supervisor {
    state: Arc<TradingState>,
    store: Arc<StateStore>,
    pulse: Arc<LivenessPulse>,
    pool: Arc<WorkerPool>,
    heartbeat: Arc<HeartbeatMonitor>,
    escalator: Arc<StuckPositionEscalator>,
    clock: Arc<dyn Clock>,
    snapshot_interval: Duration,
    shutdown_timeout: Duration,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Supervisor over the container's components.
    #[must_use]
    pub fn new(container: &Container) -> Self {
        let config = container.config();
        Self {
            state: container.state(),
            store: container.store(),
            pulse: container.pulse(),
            pool: container.pool(),
            heartbeat: container.heartbeat(),
            escalator: container.escalator(),
            clock: container.clock(),
            snapshot_interval: config.persistence.snapshot_interval(),
            shutdown_timeout: config.emergency.shutdown_timeout(),
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Token that stops every loop.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn the persistence, heartbeat and escalation loops.
    pub fn start(&mut self) {
        let tick = PersistenceTick {
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
            pulse: Arc::clone(&self.pulse),
            pool: Arc::clone(&self.pool),
            clock: Arc::clone(&self.clock),
        };
        let interval = self.snapshot_interval;
        let token = self.token.clone();
        self.handles
            .push(tokio::spawn(async move { tick.run(interval, token).await }));

        let heartbeat = Arc::clone(&self.heartbeat);
        let token = self.token.clone();
        self.handles
            .push(tokio::spawn(async move { heartbeat.run(token).await }));

        let escalator = Arc::clone(&self.escalator);
        let token = self.token.clone();
        self.handles
            .push(tokio::spawn(async move { escalator.run(token).await }));

        info!(
            snapshot_interval_ms = self.snapshot_interval.as_millis() as u64,
            "Background loops started"
        );
    }

    /// Stop every loop, wait for them within the shutdown timeout, then
    /// write a final snapshot.
    pub async fn shutdown(self) -> Option<SnapshotReceipt> {
        self.token.cancel();
        let handles = self.handles;
        let joined = tokio::time::timeout(self.shutdown_timeout, async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Background loop ended abnormally");
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Background loops did not stop in time"
            );
        }

        let store = self.store;
        let state = self.state;
        match tokio::task::spawn_blocking(move || store.snapshot_best_effort(&state)).await {
            Ok(receipt) => {
                if receipt.is_some() {
                    info!("Final state snapshot written");
                }
                receipt
            }
            Err(e) => {
                error!(error = %e, "Final snapshot task failed");
                None
            }
        }
    }
}

struct PersistenceTick {
    state: Arc<TradingState>,
    store: Arc<StateStore>,
    pulse: Arc<LivenessPulse>,
    pool: Arc<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl PersistenceTick {
    async fn run(&self, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.once().await;
                }
                () = shutdown.cancelled() => {
                    info!("Persistence loop shutting down");
                    break;
                }
            }
        }
    }

    /// One snapshot on a pool worker. Beats the pulse only if it was written.
    async fn once(&self) -> bool {
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        let task = self.pool.spawn(async move {
            tokio::task::spawn_blocking(move || store.snapshot_best_effort(&state)).await
        });
        let written = match task.await {
            Ok(Some(Ok(Some(_)))) => true,
            Ok(Some(Ok(None))) => false,
            Ok(Some(Err(e))) => {
                error!(error = %e, "Snapshot worker failed");
                false
            }
            Ok(None) => {
                warn!("Worker pool closed, snapshot skipped");
                false
            }
            Err(e) => {
                error!(error = %e, "Snapshot task failed");
                false
            }
        };
        if written {
            self.pulse.beat(self.clock.now());
        }
        written
    }
}

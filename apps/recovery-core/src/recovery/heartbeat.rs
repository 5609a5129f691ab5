//! Freeze detection with bounded self-healing.
//!
//! The persistence loop beats a [`LivenessPulse`] after every successful
//! snapshot. The monitor runs on its own schedule and measures how long ago
//! the last beat was:
//!
//! ```text
//! staleness <= stale_after                     Healthy (episode closed)
//! staleness >  stale_after, first time         Mitigating: reclaim memory,
//!                                              raise worker floor
//! staleness >  escalate_after and grace spent  Escalated: liquidate once
//! emergency flag already raised                EmergencyActive (no-op)
//! ```
//!
//! Mitigation runs once per freeze episode; escalation happens at most once
//! per episode and never while emergency mode is already active.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::emergency::TriggerSource;
use super::liquidator::{EmergencyLiquidator, LiquidationReport};
use super::process::ProcessStats;
use crate::clock::{Clock, elapsed_between};
use crate::config::HeartbeatConfig;
use crate::observability::metrics;
use crate::pool::WorkerPool;
use crate::state::TradingState;

// =============================================================================
// Liveness Pulse
// =============================================================================

/// Timestamp of the last successful snapshot, shared lock-free.
#[derive(Debug)]
pub struct LivenessPulse {
    last_beat_ms: AtomicI64,
}

impl LivenessPulse {
    /// Pulse that last beat at `at`.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            last_beat_ms: AtomicI64::new(at.timestamp_millis()),
        }
    }

    /// Record a beat.
    pub fn beat(&self, at: DateTime<Utc>) {
        self.last_beat_ms
            .fetch_max(at.timestamp_millis(), Ordering::SeqCst);
    }

    /// Time of the last beat.
    #[must_use]
    pub fn last_beat(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_beat_ms.load(Ordering::SeqCst))
            .unwrap_or_default()
    }

    /// Time since the last beat.
    #[must_use]
    pub fn staleness(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.last_beat(), now)
    }
}

// =============================================================================
// Self-healing
// =============================================================================

/// Hooks the monitor uses to try to unfreeze the process.
pub trait SelfHealer: Send + Sync {
    /// Resident memory, if measurable.
    fn memory_usage_bytes(&self) -> Option<u64>;

    /// Ask for memory to be returned without blocking the caller.
    fn request_reclamation(&self);

    /// Whether every worker is busy.
    fn worker_starved(&self) -> bool;

    /// Grow the worker pool. Returns the new size, or `None` at the cap.
    fn raise_worker_floor(&self) -> Option<usize>;
}

/// [`SelfHealer`] over the real process and the shared worker pool.
pub struct ProcessHealer {
    state: Arc<TradingState>,
    pool: Arc<WorkerPool>,
}

impl ProcessHealer {
    /// Create a healer.
    #[must_use]
    pub fn new(state: Arc<TradingState>, pool: Arc<WorkerPool>) -> Self {
        Self { state, pool }
    }
}

impl SelfHealer for ProcessHealer {
    fn memory_usage_bytes(&self) -> Option<u64> {
        ProcessStats::sample().rss_bytes
    }

    fn request_reclamation(&self) {
        let state = Arc::clone(&self.state);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || state.shrink_to_fit());
            }
            Err(_) => warn!("No runtime available for memory reclamation"),
        }
    }

    fn worker_starved(&self) -> bool {
        self.pool.is_saturated()
    }

    fn raise_worker_floor(&self) -> Option<usize> {
        self.pool.raise_floor()
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Mitigation step taken for a freeze episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationAction {
    /// Memory above ceiling; reclamation requested.
    MemoryReclamation {
        /// Measured resident bytes.
        usage_bytes: u64,
    },
    /// Workers starved; floor raised.
    WorkerFloorRaised {
        /// New floor.
        floor: usize,
    },
    /// Workers starved but the floor is at its cap.
    WorkerFloorAtMaximum,
}

impl MitigationAction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::MemoryReclamation { .. } => "memory_reclamation",
            Self::WorkerFloorRaised { .. } => "worker_floor_raised",
            Self::WorkerFloorAtMaximum => "worker_floor_at_maximum",
        }
    }
}

/// Result category of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    /// Heartbeat fresh.
    Healthy,
    /// Stale; mitigation started or grace period running.
    Mitigating,
    /// Stale past the escalation limit; liquidation triggered this episode.
    Escalated,
    /// Emergency mode already active; nothing to do.
    EmergencyActive,
}

/// Result of one check.
#[derive(Debug, Clone)]
pub struct HeartbeatCheck {
    /// Category.
    pub status: HeartbeatStatus,
    /// Time since the last beat.
    pub staleness: Duration,
    /// Mitigation taken by this check.
    pub mitigation: Vec<MitigationAction>,
    /// Liquidation triggered by this check.
    pub liquidation: Option<LiquidationReport>,
}

impl HeartbeatCheck {
    fn new(status: HeartbeatStatus, staleness: Duration) -> Self {
        Self {
            status,
            staleness,
            mitigation: Vec::new(),
            liquidation: None,
        }
    }
}

#[derive(Debug)]
struct Episode {
    mitigated_at: DateTime<Utc>,
    escalated: bool,
}

/// Watches the liveness pulse and escalates sustained freezes.
pub struct HeartbeatMonitor {
    pulse: Arc<LivenessPulse>,
    healer: Arc<dyn SelfHealer>,
    liquidator: Arc<EmergencyLiquidator>,
    clock: Arc<dyn Clock>,
    config: HeartbeatConfig,
    episode: Mutex<Option<Episode>>,
}

impl HeartbeatMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(
        pulse: Arc<LivenessPulse>,
        healer: Arc<dyn SelfHealer>,
        liquidator: Arc<EmergencyLiquidator>,
        clock: Arc<dyn Clock>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            pulse,
            healer,
            liquidator,
            clock,
            config,
            episode: Mutex::new(None),
        }
    }

    /// The pulse this monitor watches.
    #[must_use]
    pub fn pulse(&self) -> &Arc<LivenessPulse> {
        &self.pulse
    }

    /// Run one check.
    pub async fn check(&self) -> HeartbeatCheck {
        let now = self.clock.now();
        let staleness = self.pulse.staleness(now);
        metrics::set_heartbeat_staleness(staleness.as_secs_f64());

        if staleness <= self.config.stale_after() {
            if self.episode.lock().take().is_some() {
                info!(staleness_ms = staleness.as_millis() as u64, "Heartbeat recovered");
            }
            return HeartbeatCheck::new(HeartbeatStatus::Healthy, staleness);
        }

        if self.liquidator.is_emergency_active() {
            debug!("Heartbeat stale but emergency mode already active");
            return HeartbeatCheck::new(HeartbeatStatus::EmergencyActive, staleness);
        }

        let escalate = {
            let mut episode = self.episode.lock();
            match episode.as_mut() {
                None => {
                    *episode = Some(Episode {
                        mitigated_at: now,
                        escalated: false,
                    });
                    false
                }
                Some(e) if e.escalated => {
                    return HeartbeatCheck::new(HeartbeatStatus::Escalated, staleness);
                }
                Some(e) => {
                    let grace_spent =
                        elapsed_between(e.mitigated_at, now) >= self.config.grace_period();
                    let should = grace_spent && staleness > self.config.escalate_after();
                    if should {
                        e.escalated = true;
                    }
                    if !should {
                        debug!(
                            staleness_ms = staleness.as_millis() as u64,
                            "Heartbeat still stale, waiting on mitigation"
                        );
                        return HeartbeatCheck::new(HeartbeatStatus::Mitigating, staleness);
                    }
                    true
                }
            }
        };

        if escalate {
            error!(
                staleness_ms = staleness.as_millis() as u64,
                last_beat = %self.pulse.last_beat(),
                "Heartbeat frozen through mitigation, escalating to emergency mode"
            );
            let reason = format!(
                "heartbeat stale for {}s after mitigation",
                staleness.as_secs()
            );
            let report = self
                .liquidator
                .liquidate_all(TriggerSource::HeartbeatFreeze, &reason)
                .await;
            let mut check = HeartbeatCheck::new(HeartbeatStatus::Escalated, staleness);
            check.liquidation = Some(report);
            return check;
        }

        warn!(
            staleness_ms = staleness.as_millis() as u64,
            "Heartbeat stale, attempting self-healing"
        );
        let mut check = HeartbeatCheck::new(HeartbeatStatus::Mitigating, staleness);
        check.mitigation = self.mitigate();
        check
    }

    fn mitigate(&self) -> Vec<MitigationAction> {
        let mut actions = Vec::new();

        if let Some(usage) = self.healer.memory_usage_bytes() {
            if usage > self.config.memory_ceiling_bytes() {
                self.healer.request_reclamation();
                actions.push(MitigationAction::MemoryReclamation {
                    usage_bytes: usage,
                });
            }
        }

        if self.healer.worker_starved() {
            actions.push(match self.healer.raise_worker_floor() {
                Some(floor) => MitigationAction::WorkerFloorRaised { floor },
                None => MitigationAction::WorkerFloorAtMaximum,
            });
        }

        for action in &actions {
            metrics::record_heartbeat_mitigation(action.as_str());
            info!(action = ?action, "Heartbeat mitigation applied");
        }
        actions
    }

    /// Check on a fixed interval until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Heartbeat monitor disabled");
            return;
        }
        info!(
            interval_ms = self.config.check_interval_ms,
            stale_after_ms = self.config.stale_after_ms,
            escalate_after_ms = self.config.escalate_after_ms,
            "Starting heartbeat monitor"
        );

        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check().await;
                }
                () = shutdown.cancelled() => {
                    info!("Heartbeat monitor shutting down");
                    break;
                }
            }
        }
    }
}

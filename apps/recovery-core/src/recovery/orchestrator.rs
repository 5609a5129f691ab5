//! Startup crash recovery.
//!
//! ```text
//! Init ─► NoPriorState ─────────────────────────────────────────► ColdStart
//!   └───► PriorStateFound ─► Load ─► IntegrityCheck ─invalid────► ColdStart
//!                                         │ valid
//!                                         ▼
//!                                   ComputeDowntime
//!                     downtime >= threshold │ downtime < threshold
//!               ┌─────────────────────────┘ └──────────────────┐
//!               ▼                                              ▼
//!     EmergencyLiquidation ─► EmergencyMode      Reconcile ─► ReattachProtectiveOrders
//!               ▲                                              │
//!               └──────────── any failure ◄──── ResumeStrategies ─► Normal
//! ```
//!
//! Once the engine has decided positions may still be live, it never falls
//! back to trading on uncertain state: every failure after `ComputeDowntime`
//! lands in emergency mode. A raised emergency flag at startup skips the
//! machine entirely.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use super::emergency::TriggerSource;
use super::guardian::{GuardianError, GuardianReport, LegFailure, ProtectiveOrderGuardian};
use super::liquidator::{EmergencyLiquidator, LiquidationReport};
use super::reconciler::{PositionReconciler, PositionReconciliationResult, ReconcileError};
use crate::clock::{Clock, elapsed_between};
use crate::config::RecoveryConfig;
use crate::error::{Classify, ErrorKind, Phase};
use crate::observability::metrics;
use crate::persistence::{LoadOutcome, SnapshotSource, StateStore};
use crate::ports::{StrategyControlError, StrategyController};
use crate::state::TradingState;

/// Failures on the reconcile path.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Broker reconciliation failed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The guardian refused to run.
    #[error(transparent)]
    Guardian(#[from] GuardianError),

    /// Some protective legs could not be placed.
    #[error("{} protective legs could not be placed", failures.len())]
    Unprotected {
        /// Legs that failed.
        failures: Vec<LegFailure>,
    },

    /// Strategies could not be resumed.
    #[error(transparent)]
    Resume(#[from] StrategyControlError),

    /// The reconcile path ran past its deadline.
    #[error("Recovery exceeded its {}s deadline", deadline.as_secs())]
    DeadlineExceeded {
        /// Configured deadline.
        deadline: Duration,
    },
}

impl Classify for RecoveryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Reconcile(e) => e.kind(),
            Self::Guardian(e) => e.kind(),
            Self::Unprotected { .. } => ErrorKind::BrokerDivergence,
            Self::Resume(e) => e.kind(),
            Self::DeadlineExceeded { .. } => ErrorKind::Transient,
        }
    }
}

/// States of the recovery machine, recorded in the order visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    /// Start.
    Init,
    /// No state files on disk.
    NoPriorState,
    /// State files exist.
    PriorStateFound,
    /// Reading the snapshot.
    Load,
    /// Checking version, hash and age.
    IntegrityCheck,
    /// Measuring time since the last snapshot.
    ComputeDowntime,
    /// Diffing against the broker.
    Reconcile,
    /// Re-placing missing stops and targets.
    ReattachProtectiveOrders,
    /// Re-enabling strategies.
    ResumeStrategies,
    /// Flattening everything.
    EmergencyLiquidation,
    /// Terminal: empty state.
    ColdStart,
    /// Terminal: trading resumed.
    Normal,
    /// Terminal: trading halted until an operator clears the flag.
    EmergencyMode,
}

/// Which terminal state recovery reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Started with empty state.
    ColdStart,
    /// Reconciled and resumed.
    Normal,
    /// Halted.
    EmergencyMode,
}

impl RecoveryOutcome {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ColdStart => "cold_start",
            Self::Normal => "normal",
            Self::EmergencyMode => "emergency_mode",
        }
    }
}

/// Path chosen from the measured downtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPath {
    /// Short outage: reconcile and resume.
    Reconcile,
    /// Long outage: flatten everything.
    EmergencyLiquidation,
}

/// Choose a path. Downtime equal to the threshold counts as long.
#[must_use]
pub fn decide_path(downtime: Duration, threshold: Duration) -> RecoveryPath {
    if downtime >= threshold {
        RecoveryPath::EmergencyLiquidation
    } else {
        RecoveryPath::Reconcile
    }
}

/// Everything recovery did.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    /// Terminal state.
    pub outcome: RecoveryOutcome,
    /// Phases in the order visited.
    pub phases: Vec<RecoveryPhase>,
    /// Time since the loaded snapshot.
    pub downtime: Option<Duration>,
    /// Slot the snapshot came from.
    pub snapshot_source: Option<SnapshotSource>,
    /// Reconciliation result, if reconciliation ran.
    pub reconciliation: Option<PositionReconciliationResult>,
    /// Guardian result, if the guardian ran.
    pub protection: Option<GuardianReport>,
    /// Liquidation result, if liquidation ran.
    pub liquidation: Option<LiquidationReport>,
    /// Error that forced emergency mode or cold start.
    pub error: Option<String>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
}

impl RecoveryReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            outcome: RecoveryOutcome::ColdStart,
            phases: vec![RecoveryPhase::Init],
            downtime: None,
            snapshot_source: None,
            reconciliation: None,
            protection: None,
            liquidation: None,
            error: None,
            started_at,
            finished_at: started_at,
        }
    }

    fn enter(&mut self, phase: RecoveryPhase) {
        self.phases.push(phase);
    }
}

/// Startup recovery state machine.
pub struct CrashRecoveryOrchestrator {
    store: Arc<StateStore>,
    state: Arc<TradingState>,
    reconciler: Arc<PositionReconciler>,
    guardian: Arc<ProtectiveOrderGuardian>,
    liquidator: Arc<EmergencyLiquidator>,
    strategies: Arc<dyn StrategyController>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
}

impl CrashRecoveryOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        state: Arc<TradingState>,
        reconciler: Arc<PositionReconciler>,
        guardian: Arc<ProtectiveOrderGuardian>,
        liquidator: Arc<EmergencyLiquidator>,
        strategies: Arc<dyn StrategyController>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            state,
            reconciler,
            guardian,
            liquidator,
            strategies,
            clock,
            config,
        }
    }

    /// Run startup recovery to a terminal state.
    pub async fn recover(&self) -> RecoveryReport {
        let timer = Instant::now();
        let mut report = RecoveryReport::new(self.clock.now());

        if self.liquidator.is_emergency_active() {
            self.resume_in_emergency_mode(&mut report).await;
        } else {
            match self.store.load() {
                LoadOutcome::NoPriorState => {
                    report.enter(RecoveryPhase::NoPriorState);
                    self.cold_start(&mut report, None);
                }
                LoadOutcome::Unusable { reasons } => {
                    report.enter(RecoveryPhase::PriorStateFound);
                    report.enter(RecoveryPhase::Load);
                    report.enter(RecoveryPhase::IntegrityCheck);
                    self.cold_start(&mut report, Some(reasons.join("; ")));
                }
                LoadOutcome::Loaded { snapshot, source } => {
                    report.enter(RecoveryPhase::PriorStateFound);
                    report.enter(RecoveryPhase::Load);
                    report.enter(RecoveryPhase::IntegrityCheck);
                    report.enter(RecoveryPhase::ComputeDowntime);
                    report.snapshot_source = Some(source);
                    self.state.restore(&snapshot);

                    let downtime = elapsed_between(snapshot.last_updated, self.clock.now());
                    report.downtime = Some(downtime);
                    info!(
                        downtime_ms = downtime.as_millis() as u64,
                        threshold_ms = self.config.downtime_threshold().as_millis() as u64,
                        positions = snapshot.open_position_count(),
                        source = ?source,
                        "Prior state loaded"
                    );

                    match decide_path(downtime, self.config.downtime_threshold()) {
                        RecoveryPath::EmergencyLiquidation => {
                            let reason = format!(
                                "downtime {}s at or above {}s threshold",
                                downtime.as_secs_f64(),
                                self.config.downtime_threshold().as_secs_f64()
                            );
                            self.liquidate(&mut report, TriggerSource::StaleRecovery, reason)
                                .await;
                        }
                        RecoveryPath::Reconcile => self.reconcile_and_resume(&mut report).await,
                    }
                }
            }
        }

        self.store.snapshot_best_effort(&self.state);
        report.finished_at = self.clock.now();
        metrics::record_recovery_outcome(report.outcome.as_str(), timer.elapsed().as_secs_f64());
        info!(
            outcome = report.outcome.as_str(),
            phases = ?report.phases,
            "Startup recovery finished"
        );
        report
    }

    fn cold_start(&self, report: &mut RecoveryReport, reason: Option<String>) {
        if let Some(reason) = &reason {
            warn!(reason = %reason, "Prior state unusable, cold starting");
        } else {
            info!("No prior state, cold starting");
        }
        self.state.reset();
        report.error = reason;
        report.enter(RecoveryPhase::ColdStart);
        report.outcome = RecoveryOutcome::ColdStart;
    }

    async fn reconcile_and_resume(&self, report: &mut RecoveryReport) {
        let deadline = self.config.operation_deadline();
        let result = match tokio::time::timeout(deadline, self.run_reconcile_path(report)).await {
            Ok(result) => result,
            Err(_) => Err(RecoveryError::DeadlineExceeded { deadline }),
        };

        match result {
            Ok(()) => {
                report.enter(RecoveryPhase::Normal);
                report.outcome = RecoveryOutcome::Normal;
            }
            Err(e) => {
                let action = e.policy(Phase::StartupRecovery);
                error!(error = %e, kind = e.kind().as_str(), policy = ?action, "Recovery failed, escalating");
                report.error = Some(e.to_string());
                self.liquidate(report, TriggerSource::RecoveryFailure, e.to_string())
                    .await;
            }
        }
    }

    async fn run_reconcile_path(&self, report: &mut RecoveryReport) -> Result<(), RecoveryError> {
        report.enter(RecoveryPhase::Reconcile);
        let reconciliation = self.reconciler.reconcile().await?;
        report.reconciliation = Some(reconciliation);

        report.enter(RecoveryPhase::ReattachProtectiveOrders);
        let protection = self.guardian.reattach_all().await?;
        let failures = protection.failures.clone();
        report.protection = Some(protection);
        if !failures.is_empty() {
            return Err(RecoveryError::Unprotected { failures });
        }

        report.enter(RecoveryPhase::ResumeStrategies);
        self.strategies.resume_all().await?;
        Ok(())
    }

    async fn liquidate(&self, report: &mut RecoveryReport, source: TriggerSource, reason: String) {
        report.enter(RecoveryPhase::EmergencyLiquidation);
        let liquidation = self.liquidator.liquidate_all(source, &reason).await;
        report.liquidation = Some(liquidation);
        report.enter(RecoveryPhase::EmergencyMode);
        report.outcome = RecoveryOutcome::EmergencyMode;
    }

    /// The flag survived the restart: restore what we can, sync with the
    /// broker and stay halted. Positions the broker still holds are
    /// flattened again; if the broker cannot confirm them they are reported
    /// as unprotected.
    async fn resume_in_emergency_mode(&self, report: &mut RecoveryReport) {
        warn!("Emergency flag present at startup, staying in emergency mode");
        if let LoadOutcome::Loaded { snapshot, source } = self.store.load() {
            self.state.restore(&snapshot);
            report.snapshot_source = Some(source);
        }

        let reconciled = match tokio::time::timeout(
            self.config.operation_deadline(),
            self.reconciler.reconcile(),
        )
        .await
        {
            Ok(Ok(result)) => {
                report.reconciliation = Some(result);
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Reconciliation in emergency mode failed");
                false
            }
            Err(_) => {
                warn!("Reconciliation in emergency mode timed out");
                false
            }
        };

        let open = self.state.open_positions();
        if !open.is_empty() && reconciled {
            warn!(
                positions = open.len(),
                "Broker still holds positions in emergency mode, flattening"
            );
            report.enter(RecoveryPhase::EmergencyLiquidation);
            let source = self
                .liquidator
                .flag()
                .record()
                .map_or(TriggerSource::RecoveryFailure, |r| r.source);
            let liquidation = self
                .liquidator
                .liquidate_all(source, "positions still open at startup in emergency mode")
                .await;
            report.liquidation = Some(liquidation);
        } else if !open.is_empty() {
            let symbols: Vec<&str> = open.iter().map(|p| p.symbol.as_str()).collect();
            error!(
                symbols = ?symbols,
                "Emergency mode with unconfirmed positions and no protection"
            );
            self.liquidator.alert(&format!(
                "CRITICAL UNPROTECTED POSITIONS emergency mode active at startup, broker unavailable, symbols={} manual flattening required",
                symbols.join(",")
            ));
        }

        if let Err(e) = self
            .strategies
            .disable_all("emergency mode active at startup")
            .await
        {
            error!(error = %e, "Failed to disable strategies in emergency mode");
        }

        report.error = self.liquidator.flag().record().map(|r| r.reason);
        report.enter(RecoveryPhase::EmergencyMode);
        report.outcome = RecoveryOutcome::EmergencyMode;
    }
}

//! Crash and freeze recovery.
//!
//! - [`PositionReconciler`]: broker-authoritative position diff
//! - [`ProtectiveOrderGuardian`]: idempotent stop/target re-attachment
//! - [`EmergencyLiquidator`]: flatten everything, halt, alert
//! - [`CrashRecoveryOrchestrator`]: startup state machine
//! - [`HeartbeatMonitor`]: freeze detection with bounded self-healing
//! - [`CrashGuard`]: crash dumps and bounded protection on panic

mod backoff;
mod crash;
mod emergency;
mod guardian;
mod heartbeat;
mod liquidator;
mod orchestrator;
mod process;
mod reconciler;

pub use backoff::{BackupRetryPolicy, ExponentialBackoff};
pub use crash::{CrashDump, CrashGuard, FaultOutcome, ProtectionOutcome};
pub use emergency::{EmergencyFlag, EmergencyRecord, OrderBlocked, TriggerSource};
pub use guardian::{
    GuardianError, GuardianReport, LegFailure, PlacedLeg, ProtectiveLeg, ProtectiveOrderGuardian,
};
pub use heartbeat::{
    HeartbeatCheck, HeartbeatMonitor, HeartbeatStatus, LivenessPulse, MitigationAction,
    ProcessHealer, SelfHealer,
};
pub use liquidator::{
    CancelFailure, EmergencyLiquidator, HaltReport, LiquidationPath, LiquidationReport,
    PositionLiquidation,
};
pub use orchestrator::{
    CrashRecoveryOrchestrator, RecoveryError, RecoveryOutcome, RecoveryPath, RecoveryPhase,
    RecoveryReport, decide_path,
};
pub use process::ProcessStats;
pub use reconciler::{
    DiscrepancyKind, DiscrepancyResolution, PositionDiscrepancy, PositionReconciler,
    PositionReconciliationResult, ReconcileError,
};

//! Stuck-position detection and the graduated recovery ladder.
//!
//! - [`PositionClassifier`]: health rules for local and ghost positions
//! - [`StuckPositionEscalator`]: per-position ladder, resolution, incidents
//! - [`IncidentLog`]: JSON-lines archive of alerts and incidents

mod classifier;
mod escalator;
mod incidents;
mod types;

pub use classifier::{Classification, PositionClassifier, reference_price};
pub use escalator::{EvaluationSummary, StuckPositionEscalator};
pub use incidents::{IncidentLog, IncidentRecord};
pub use types::{
    ActionResult, EscalationError, ExitAttempt, FinalOutcome, PositionClassification,
    PositionRecoveryState, RecoveryAction, RecoveryActionType, RecoveryIncident, RecoveryLevel,
    StuckPositionAlert, slippage,
};

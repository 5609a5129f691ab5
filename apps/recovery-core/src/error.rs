//! Error classification and recovery policy.
//!
//! Subsystem errors are plain `thiserror` enums. Each one implements
//! [`Classify`], which maps it onto an [`ErrorKind`]. The kind is then
//! resolved through an explicit policy table into the action the caller
//! must take.
//!
//! | Kind | Steady state | Startup recovery |
//! |------|--------------|------------------|
//! | `Transient` | retry next tick | escalate |
//! | `StateIntegrity` | cold start | cold start |
//! | `BrokerDivergence` | reconcile | escalate |
//! | `Unrecoverable` | escalate | escalate |
//!
//! Startup recovery is fail-closed: anything that goes wrong while the
//! engine is re-establishing its view of the world ends in emergency mode,
//! except an unusable snapshot, which is handled by starting cold.

use serde::{Deserialize, Serialize};

/// Category of a failure, independent of which subsystem raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// I/O hiccup, timeout or cancellation. Safe to try again.
    Transient,
    /// Persisted state is corrupt, missing or stale.
    StateIntegrity,
    /// The broker disagrees with local state.
    BrokerDivergence,
    /// Panic, prolonged freeze or broken invariant.
    Unrecoverable,
}

impl ErrorKind {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::StateIntegrity => "state_integrity",
            Self::BrokerDivergence => "broker_divergence",
            Self::Unrecoverable => "unrecoverable",
        }
    }
}

/// What the caller does about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Log and try again on the next scheduled tick.
    RetryNextTick,
    /// Discard persisted state and start fresh.
    ColdStart,
    /// Treat the broker as truth and reconcile.
    Reconcile,
    /// Enter emergency mode.
    Escalate,
}

/// Context in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Normal trading with the scheduled loops running.
    SteadyState,
    /// Orchestrated crash recovery at process start.
    StartupRecovery,
}

/// Resolve an error kind to a policy action.
#[must_use]
pub const fn resolve(kind: ErrorKind, phase: Phase) -> PolicyAction {
    match (phase, kind) {
        (_, ErrorKind::StateIntegrity) => PolicyAction::ColdStart,
        (_, ErrorKind::Unrecoverable) | (Phase::StartupRecovery, _) => PolicyAction::Escalate,
        (Phase::SteadyState, ErrorKind::Transient) => PolicyAction::RetryNextTick,
        (Phase::SteadyState, ErrorKind::BrokerDivergence) => PolicyAction::Reconcile,
    }
}

/// Implemented by every subsystem error.
pub trait Classify {
    /// Category of this failure.
    fn kind(&self) -> ErrorKind;

    /// Policy action for this failure in the given phase.
    fn policy(&self, phase: Phase) -> PolicyAction {
        resolve(self.kind(), phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ErrorKind::Transient, Phase::SteadyState, PolicyAction::RetryNextTick)]
    #[test_case(ErrorKind::StateIntegrity, Phase::SteadyState, PolicyAction::ColdStart)]
    #[test_case(ErrorKind::BrokerDivergence, Phase::SteadyState, PolicyAction::Reconcile)]
    #[test_case(ErrorKind::Unrecoverable, Phase::SteadyState, PolicyAction::Escalate)]
    #[test_case(ErrorKind::Transient, Phase::StartupRecovery, PolicyAction::Escalate)]
    #[test_case(ErrorKind::StateIntegrity, Phase::StartupRecovery, PolicyAction::ColdStart)]
    #[test_case(ErrorKind::BrokerDivergence, Phase::StartupRecovery, PolicyAction::Escalate)]
    #[test_case(ErrorKind::Unrecoverable, Phase::StartupRecovery, PolicyAction::Escalate)]
    fn test_policy_table(kind: ErrorKind, phase: Phase, expected: PolicyAction) {
        assert_eq!(resolve(kind, phase), expected);
    }

    #[derive(Debug)]
    struct Timeout;

    impl Classify for Timeout {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Transient
        }
    }

    #[test]
    fn test_classify_default_policy() {
        assert_eq!(Timeout.policy(Phase::SteadyState), PolicyAction::RetryNextTick);
        assert_eq!(Timeout.policy(Phase::StartupRecovery), PolicyAction::Escalate);
    }
}

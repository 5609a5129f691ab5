// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Recovery Core - Trading Engine Resilience Library
//!
//! Keeps a futures trading engine's view of its positions consistent with
//! the broker across crashes, freezes and exits that refuse to fill.
//!
//! # Architecture
//!
//! ```text
//!  startup ─► CrashRecoveryOrchestrator ─► StateStore (primary / backup)
//!                   │
//!                   ├─► PositionReconciler ──► broker (authoritative)
//!                   ├─► ProtectiveOrderGuardian
//!                   └─► EmergencyLiquidator ─► EmergencyFlag + alerts
//!
//!  runtime ─► Supervisor ─┬─ persistence tick ─► snapshot + liveness pulse
//!                         ├─ HeartbeatMonitor ─► heal or liquidate
//!                         └─ StuckPositionEscalator ─► recovery ladder
//! ```
//!
//! ## Layers
//!
//! - **Models** ([`models`], [`state`]): positions, orders, snapshots, and
//!   the shared in-memory trading state
//! - **Ports** ([`ports`]): broker, strategy control and alert traits
//! - **Recovery** ([`recovery`], [`escalation`]): the resilience components
//! - **Persistence** ([`persistence`]): atomic snapshots and JSON-lines logs
//! - **Infrastructure** ([`infrastructure`]): paper broker, file alerts and
//!   the dependency injection container
//!
//! Every component takes its thresholds from [`config::Config`] and reads
//! time through [`clock::Clock`], so the whole stack runs against a manual
//! clock in tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Core
// =============================================================================

/// Time source abstraction.
pub mod clock;

/// YAML configuration with environment interpolation.
pub mod config;

/// Error classification shared across components.
pub mod error;

/// Domain models.
pub mod models;

/// Shared in-memory trading state.
pub mod state;

// =============================================================================
// Components
// =============================================================================

/// Stuck-position detection and recovery ladder.
pub mod escalation;

/// Snapshot store and append-only logs.
pub mod persistence;

/// Bounded, resizable worker pool.
pub mod pool;

/// Broker, strategy and alert ports.
pub mod ports;

/// Crash and freeze recovery.
pub mod recovery;

// =============================================================================
// Runtime
// =============================================================================

/// Adapters and dependency injection.
pub mod infrastructure;

/// Prometheus instrumentation.
pub mod observability;

/// Background loops and graceful shutdown.
pub mod runtime;

/// Tracing subscriber setup.
pub mod telemetry;

// =============================================================================
// Re-exports
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError, load_config};
pub use escalation::{RecoveryLevel, StuckPositionEscalator};
pub use infrastructure::{
    Container, FileAlertSink, PaperBroker, Ports, StateStrategyController,
};
pub use models::{BrokerPosition, PendingOrder, Position, SystemStateSnapshot};
pub use persistence::StateStore;
pub use recovery::{
    CrashRecoveryOrchestrator, EmergencyFlag, EmergencyLiquidator, HeartbeatMonitor,
    PositionReconciler, ProtectiveOrderGuardian, RecoveryOutcome, RecoveryReport,
};
pub use runtime::Supervisor;
pub use state::TradingState;

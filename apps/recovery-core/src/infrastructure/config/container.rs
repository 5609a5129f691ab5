//! Dependency Injection Container
//!
//! Wires every recovery component around one shared trading state and the
//! broker, strategy and alert ports.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::Config;
use crate::escalation::{IncidentLog, StuckPositionEscalator};
use crate::persistence::{JsonlLog, StateStore};
use crate::pool::WorkerPool;
use crate::ports::{AlertSink, BrokerPositionProvider, OrderExecutionGateway, StrategyController};
use crate::recovery::{
    CrashGuard, CrashRecoveryOrchestrator, EmergencyFlag, EmergencyLiquidator, HeartbeatMonitor,
    LivenessPulse, PositionReconciler, ProcessHealer, ProtectiveOrderGuardian,
};
use crate::state::TradingState;

/// External adapters the container wires around.
pub struct Ports {
    /// Broker position queries.
    pub positions: Arc<dyn BrokerPositionProvider>,
    /// Broker order execution.
    pub gateway: Arc<dyn OrderExecutionGateway>,
    /// Strategy enable/disable.
    pub strategies: Arc<dyn StrategyController>,
    /// Operator alerts.
    pub alerts: Arc<dyn AlertSink>,
}

/// Dependency injection container.
///
/// Holds every wired component. Components share one [`TradingState`],
/// one [`EmergencyFlag`] and one [`LivenessPulse`].
pub struct Container {
    config: Config,
    clock: Arc<dyn Clock>,
    state: Arc<TradingState>,
    store: Arc<StateStore>,
    flag: Arc<EmergencyFlag>,
    pool: Arc<WorkerPool>,
    pulse: Arc<LivenessPulse>,
    alerts: Arc<dyn AlertSink>,
    reconciler: Arc<PositionReconciler>,
    guardian: Arc<ProtectiveOrderGuardian>,
    liquidator: Arc<EmergencyLiquidator>,
    orchestrator: Arc<CrashRecoveryOrchestrator>,
    heartbeat: Arc<HeartbeatMonitor>,
    escalator: Arc<StuckPositionEscalator>,
    crash_guard: Arc<CrashGuard>,
}

impl Container {
    /// Wire every component around `state`.
    ///
    /// The emergency flag is read from disk here, so a flag left by a
    /// previous run is active before anything can place an order.
    #[must_use]
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        state: Arc<TradingState>,
        ports: Ports,
    ) -> Self {
        let now = clock.now();
        let store = Arc::new(StateStore::new(&config.persistence, clock.clone()));
        let flag = Arc::new(EmergencyFlag::load(config.emergency.flag_path(), now));
        let heartbeat_config = &config.heartbeat;
        let pool = Arc::new(WorkerPool::new(
            heartbeat_config.worker_floor,
            heartbeat_config.worker_floor_step,
            heartbeat_config.max_workers,
        ));
        let pulse = Arc::new(LivenessPulse::new(now));

        let reconciler = Arc::new(
            PositionReconciler::new(
                ports.positions.clone(),
                state.clone(),
                clock.clone(),
                config.recovery.adopted_strategy_id.clone(),
                config.recovery.broker_call_timeout(),
            )
            .with_audit_log(JsonlLog::new(
                config.persistence.reconciliation_audit_path(),
            )),
        );
        let guardian = Arc::new(ProtectiveOrderGuardian::new(
            state.clone(),
            ports.gateway.clone(),
            flag.clone(),
            clock.clone(),
            config.protection.clone(),
            config.recovery.broker_call_timeout(),
        ));
        let liquidator = Arc::new(EmergencyLiquidator::new(
            state.clone(),
            ports.gateway.clone(),
            ports.strategies.clone(),
            ports.alerts.clone(),
            flag.clone(),
            clock.clone(),
            config.emergency.clone(),
        ));
        let orchestrator = Arc::new(CrashRecoveryOrchestrator::new(
            store.clone(),
            state.clone(),
            reconciler.clone(),
            guardian.clone(),
            liquidator.clone(),
            ports.strategies.clone(),
            clock.clone(),
            config.recovery.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            pulse.clone(),
            Arc::new(ProcessHealer::new(state.clone(), pool.clone())),
            liquidator.clone(),
            clock.clone(),
            config.heartbeat.clone(),
        ));
        let incident_log = IncidentLog::new(
            std::path::PathBuf::from(&config.persistence.state_dir)
                .join(&config.escalation.incident_log_file),
        );
        let escalator = Arc::new(
            StuckPositionEscalator::new(
                state.clone(),
                ports.positions.clone(),
                ports.gateway.clone(),
                liquidator.clone(),
                ports.alerts.clone(),
                clock.clone(),
                config.escalation.clone(),
            )
            .with_incident_log(incident_log)
            .with_pool(pool.clone()),
        );
        let crash_guard = Arc::new(CrashGuard::new(
            state.clone(),
            pulse.clone(),
            liquidator.clone(),
            ports.alerts.clone(),
            clock.clone(),
            config.emergency.crash_dump_dir(),
            config.emergency.shutdown_timeout(),
            config.persistence.system_version.clone(),
        ));

        Self {
            config,
            clock,
            state,
            store,
            flag,
            pool,
            pulse,
            alerts: ports.alerts,
            reconciler,
            guardian,
            liquidator,
            orchestrator,
            heartbeat,
            escalator,
            crash_guard,
        }
    }

    /// Loaded configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Shared clock.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Shared trading state.
    pub fn state(&self) -> Arc<TradingState> {
        Arc::clone(&self.state)
    }

    /// Snapshot store.
    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    /// Emergency flag and order gate.
    pub fn flag(&self) -> Arc<EmergencyFlag> {
        Arc::clone(&self.flag)
    }

    /// Shared worker pool.
    pub fn pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.pool)
    }

    /// Liveness pulse beaten by the persistence loop.
    pub fn pulse(&self) -> Arc<LivenessPulse> {
        Arc::clone(&self.pulse)
    }

    /// Operator alert sink.
    pub fn alerts(&self) -> Arc<dyn AlertSink> {
        Arc::clone(&self.alerts)
    }

    /// Position reconciler.
    pub fn reconciler(&self) -> Arc<PositionReconciler> {
        Arc::clone(&self.reconciler)
    }

    /// Protective order guardian.
    pub fn guardian(&self) -> Arc<ProtectiveOrderGuardian> {
        Arc::clone(&self.guardian)
    }

    /// Emergency liquidator.
    pub fn liquidator(&self) -> Arc<EmergencyLiquidator> {
        Arc::clone(&self.liquidator)
    }

    /// Startup recovery orchestrator.
    pub fn orchestrator(&self) -> Arc<CrashRecoveryOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Heartbeat monitor.
    pub fn heartbeat(&self) -> Arc<HeartbeatMonitor> {
        Arc::clone(&self.heartbeat)
    }

    /// Stuck-position escalator.
    pub fn escalator(&self) -> Arc<StuckPositionEscalator> {
        Arc::clone(&self.escalator)
    }

    /// Crash guard for the panic hook.
    pub fn crash_guard(&self) -> Arc<CrashGuard> {
        Arc::clone(&self.crash_guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::infrastructure::{PaperBroker, RecordingAlertSink, StateStrategyController};
    use crate::recovery::RecoveryOutcome;
    use chrono::Utc;

    fn container(dir: &std::path::Path) -> (Container, Arc<PaperBroker>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let mut config = Config::default();
        config.persistence.state_dir = dir.display().to_string();
        config.emergency.flag_path = dir.join("EMERGENCY").display().to_string();
        config.emergency.crash_dump_dir = dir.join("crash").display().to_string();
        config.emergency.alert_log_path = dir.join("alerts.log").display().to_string();

        let broker = Arc::new(PaperBroker::new(clock.clone()));
        let state = Arc::new(TradingState::new());
        let ports = Ports {
            positions: broker.clone(),
            gateway: broker.clone(),
            strategies: Arc::new(StateStrategyController::new(state.clone(), clock.clone())),
            alerts: Arc::new(RecordingAlertSink::default()),
        };
        (Container::new(config, clock, state, ports), broker)
    }

    #[test]
    fn test_components_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let (container, _) = container(dir.path());
        assert!(Arc::ptr_eq(&container.state(), &container.state));
        assert!(Arc::ptr_eq(container.liquidator().flag(), &container.flag()));
        assert!(!container.flag().is_active());
    }

    #[tokio::test]
    async fn test_wired_recovery_cold_starts() {
        let dir = tempfile::tempdir().unwrap();
        let (container, _) = container(dir.path());
        let report = container.orchestrator().recover().await;
        assert_eq!(report.outcome, RecoveryOutcome::ColdStart);
    }
}

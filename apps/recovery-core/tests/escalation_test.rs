//! Stuck-Position Escalation Integration Tests
//!
//! Runs the wired escalator against the paper broker:
//! - An aged-out position exits at the first rung and closes its incident
//! - A resting exit that fills later is not followed by another order
//! - A position only the broker knows about is flattened
//! - The emergency order gate blocks every ladder order

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use recovery_core::clock::{Clock, ManualClock};
use recovery_core::config::Config;
use recovery_core::escalation::{
    ActionResult, FinalOutcome, IncidentLog, IncidentRecord, PositionClassification,
    RecoveryLevel,
};
use recovery_core::infrastructure::{
    Container, PaperBroker, Ports, RecordingAlertSink, StateStrategyController,
};
use recovery_core::models::{OrderSide, OrderType, Position, StrategyState};
use recovery_core::recovery::{EmergencyRecord, TriggerSource};
use recovery_core::state::TradingState;
use rust_decimal_macros::dec;

struct Rig {
    _dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
    broker: Arc<PaperBroker>,
    container: Container,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2026, 3, 2, 19, 0, 0).single().unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let dyn_clock: Arc<dyn Clock> = clock.clone();

    let mut config = Config::default();
    config.persistence.state_dir = dir.path().join("state").display().to_string();
    config.emergency.flag_path = dir.path().join("EMERGENCY").display().to_string();
    config.emergency.crash_dump_dir = dir.path().join("crash").display().to_string();

    let broker = Arc::new(PaperBroker::new(dyn_clock.clone()));
    let state = Arc::new(TradingState::new());
    state.upsert_strategy(StrategyState::enabled("orb", clock.now()));
    let ports = Ports {
        positions: broker.clone(),
        gateway: broker.clone(),
        strategies: Arc::new(StateStrategyController::new(
            state.clone(),
            dyn_clock.clone(),
        )),
        alerts: Arc::new(RecordingAlertSink::default()),
    };
    let container = Container::new(config, dyn_clock, state, ports);

    Rig {
        _dir: dir,
        clock,
        broker,
        container,
    }
}

fn incident_log(rig: &Rig) -> IncidentLog {
    let config = rig.container.config();
    IncidentLog::new(
        std::path::PathBuf::from(&config.persistence.state_dir)
            .join(&config.escalation.incident_log_file),
    )
}

#[tokio::test]
async fn test_aged_out_position_exits_at_smart_retry_and_resolves() {
    let rig = rig();
    let state = rig.container.state();
    let entry = rig.clock.now() - TimeDelta::minutes(260);
    state.upsert_position(Position::new("ES", dec!(2), dec!(5000), entry, "orb"));
    state.record_price("ES", dec!(5000), rig.clock.now());
    rig.broker.set_position("ES", dec!(2), dec!(5000));
    rig.broker.set_price("ES", dec!(5000));
    let escalator = rig.container.escalator();

    let first = escalator.evaluate_all().await;

    assert_eq!(first.opened.len(), 1);
    assert_eq!(first.opened[0].classification, PositionClassification::AgedOut);
    assert_eq!(first.opened[0].position_id, "orb:ES");
    assert_eq!(
        first.escalations,
        vec![("ES".to_string(), RecoveryLevel::SmartRetry)]
    );
    let sent = rig.broker.submitted();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].order_type, OrderType::Limit);
    assert_eq!(sent[0].side, OrderSide::Sell);
    assert_eq!(sent[0].limit_price, Some(dec!(4995.00)));
    assert_eq!(rig.broker.position_quantity("ES"), dec!(0));

    rig.clock.advance(Duration::from_secs(1));
    let second = escalator.evaluate_all().await;

    assert_eq!(second.resolved.len(), 1);
    let incident = &second.resolved[0];
    assert_eq!(incident.final_outcome, FinalOutcome::ResolvedAutomatically);
    assert_eq!(incident.max_level_reached, RecoveryLevel::SmartRetry);
    assert_eq!(incident.slippage_cost, Some(dec!(10.00)));
    assert!(!incident.required_human_intervention);
    assert_eq!(escalator.active_count(), 0);

    let records = incident_log(&rig).read_all().unwrap();
    assert_eq!(records.len(), 2);
    assert!(matches!(records[0], IncidentRecord::Alert(_)));
    assert!(matches!(records[1], IncidentRecord::Incident(_)));

    rig.clock.advance(Duration::from_secs(1));
    let third = escalator.evaluate_all().await;
    assert!(third.resolved.is_empty());
    assert_eq!(escalator.resolved_incidents().len(), 1);
}

#[tokio::test]
async fn test_resting_exit_filled_later_is_not_repeated() {
    let rig = rig();
    let state = rig.container.state();
    let entry = rig.clock.now() - TimeDelta::minutes(260);
    state.upsert_position(Position::new("ES", dec!(2), dec!(5000), entry, "orb"));
    state.record_price("ES", dec!(5000), rig.clock.now());
    rig.broker.set_position("ES", dec!(2), dec!(5000));
    rig.broker.set_price("ES", dec!(5000));
    rig.broker.hold_fills_for("ES");
    let escalator = rig.container.escalator();

    escalator.evaluate_all().await;
    let Some(order_id) = escalator
        .recovery("ES")
        .await
        .and_then(|r| r.active_order_id)
    else {
        panic!("SmartRetry exit should be working");
    };
    assert!(rig.broker.fill_resting(&order_id));
    rig.broker.release_fills_for("ES");

    let mut resolved = Vec::new();
    for _ in 0..4 {
        rig.clock.advance(Duration::from_secs(10));
        resolved.extend(escalator.evaluate_all().await.resolved);
    }

    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].slippage_cost, Some(dec!(10.00)));
    assert_eq!(rig.broker.submitted().len(), 1);
    assert_eq!(rig.broker.position_quantity("ES"), dec!(0));
    assert!(state.position("ES").is_none());
}

#[tokio::test]
async fn test_ghost_position_is_flattened() {
    let rig = rig();
    rig.broker.set_position("NQ", dec!(-1), dec!(18000));
    rig.broker.set_price("NQ", dec!(18000));
    let escalator = rig.container.escalator();

    let first = escalator.evaluate_all().await;

    assert_eq!(first.opened.len(), 1);
    assert_eq!(
        first.opened[0].classification,
        PositionClassification::GhostPosition
    );
    assert_eq!(first.opened[0].position_id, "ghost:NQ");
    let sent = rig.broker.submitted();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].side, OrderSide::Buy);
    assert_eq!(sent[0].quantity, dec!(1));
    assert_eq!(rig.broker.position_quantity("NQ"), dec!(0));

    rig.clock.advance(Duration::from_secs(1));
    let second = escalator.evaluate_all().await;
    assert_eq!(second.resolved.len(), 1);
    assert_eq!(second.resolved[0].symbol, "NQ");
}

#[tokio::test]
async fn test_emergency_mode_blocks_ladder_orders() {
    let rig = rig();
    let state = rig.container.state();
    let mut position = Position::new("ES", dec!(1), dec!(5000), rig.clock.now(), "orb");
    position.mark(dec!(4970), dec!(50));
    state.upsert_position(position);
    state.record_price("ES", dec!(4970), rig.clock.now());
    rig.broker.set_position("ES", dec!(1), dec!(5000));
    rig.broker.set_price("ES", dec!(4970));
    rig.container.flag().activate(EmergencyRecord {
        activated_at: rig.clock.now(),
        source: TriggerSource::UnhandledFault,
        reason: "fault before evaluation".to_string(),
    });
    let escalator = rig.container.escalator();

    let summary = escalator.evaluate_all().await;

    assert_eq!(summary.opened.len(), 1);
    assert_eq!(
        summary.opened[0].classification,
        PositionClassification::RunawayLoss
    );
    assert!(rig.broker.submitted().is_empty());
    let recovery = escalator.recovery("ES").await.unwrap();
    assert_eq!(
        recovery.actions.last().map(|a| a.result),
        Some(ActionResult::Blocked)
    );
    assert_eq!(rig.broker.position_quantity("ES"), dec!(1));
}

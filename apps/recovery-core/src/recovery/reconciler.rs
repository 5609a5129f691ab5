//! Position reconciliation against the broker.
//!
//! The broker is authoritative. Every difference between the persisted
//! positions and the broker's report is recorded as a discrepancy and
//! resolved in the broker's favor:
//!
//! | Local | Broker | Kind | Resolution |
//! |-------|--------|------|------------|
//! | open | absent or flat | `BotOnly` | closed during downtime, removed |
//! | qty A | qty B ≠ A | `QuantityMismatch` | overwritten with broker values |
//! | absent | open | `BrokerOnly` | opened during downtime, adopted |
//! | qty A | qty A | none | untouched |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Classify, ErrorKind};
use crate::models::{BrokerPosition, Position, PositionSide};
use crate::observability::metrics;
use crate::persistence::JsonlLog;
use crate::ports::{BrokerError, BrokerPositionProvider};
use crate::state::TradingState;

/// Errors from reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The broker could not be queried.
    #[error("Broker query failed: {0}")]
    Broker(#[from] BrokerError),
}

impl Classify for ReconcileError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Broker(e) => e.kind(),
        }
    }
}

/// Where a position exists when the two views disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyKind {
    /// The broker holds a position the engine has no record of.
    BrokerOnly,
    /// The engine holds a position the broker does not.
    BotOnly,
    /// Both hold the symbol with different quantities.
    QuantityMismatch,
}

impl DiscrepancyKind {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BrokerOnly => "broker_only",
            Self::BotOnly => "bot_only",
            Self::QuantityMismatch => "quantity_mismatch",
        }
    }
}

/// What was done about a discrepancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyResolution {
    /// Local position removed; it closed while the engine was down.
    RemovedClosedDuringDowntime,
    /// Local quantity and price overwritten with the broker's.
    OverwrittenFromBroker,
    /// Broker position adopted into local state.
    AdoptedFromBroker,
}

/// One difference between local and broker positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionDiscrepancy {
    /// Instrument symbol.
    pub symbol: String,
    /// Kind of difference.
    pub kind: DiscrepancyKind,
    /// Broker quantity, if the broker holds the symbol.
    pub broker_quantity: Option<Decimal>,
    /// Broker average price.
    pub broker_avg_price: Option<Decimal>,
    /// Local quantity, if the engine holds the symbol.
    pub bot_quantity: Option<Decimal>,
    /// Local entry price.
    pub bot_avg_price: Option<Decimal>,
    /// Action taken.
    pub resolution: DiscrepancyResolution,
}

/// Immutable audit record of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReconciliationResult {
    /// When the pass ran.
    pub timestamp: DateTime<Utc>,
    /// Local positions examined.
    pub bot_positions: usize,
    /// Open broker positions examined.
    pub broker_positions: usize,
    /// Symbols that already agreed.
    pub matched: usize,
    /// Every difference found.
    pub discrepancies: Vec<PositionDiscrepancy>,
    /// Human-readable actions, in order.
    pub actions_taken: Vec<String>,
}

impl PositionReconciliationResult {
    /// Whether both views already agreed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }

    /// Number of discrepancies of one kind.
    #[must_use]
    pub fn count_of(&self, kind: DiscrepancyKind) -> usize {
        self.discrepancies.iter().filter(|d| d.kind == kind).count()
    }
}

/// Diffs local positions against the broker and applies broker truth.
pub struct PositionReconciler {
    broker: Arc<dyn BrokerPositionProvider>,
    state: Arc<TradingState>,
    clock: Arc<dyn Clock>,
    audit: Option<JsonlLog>,
    adopted_strategy_id: String,
    call_timeout: Duration,
}

impl PositionReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerPositionProvider>,
        state: Arc<TradingState>,
        clock: Arc<dyn Clock>,
        adopted_strategy_id: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            state,
            clock,
            audit: None,
            adopted_strategy_id: adopted_strategy_id.into(),
            call_timeout,
        }
    }

    /// Append every result to an audit log.
    #[must_use]
    pub fn with_audit_log(mut self, audit: JsonlLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Query the broker and reconcile.
    pub async fn reconcile(&self) -> Result<PositionReconciliationResult, ReconcileError> {
        let broker_positions =
            match tokio::time::timeout(self.call_timeout, self.broker.get_positions()).await {
                Ok(result) => result?,
                Err(_) => return Err(BrokerError::timeout("get_positions").into()),
            };
        Ok(self.apply(&broker_positions))
    }

    /// Reconcile local state against an already-fetched broker report.
    pub fn apply(&self, broker_positions: &[BrokerPosition]) -> PositionReconciliationResult {
        let now = self.clock.now();
        let broker: BTreeMap<&str, &BrokerPosition> = broker_positions
            .iter()
            .filter(|b| b.is_open())
            .map(|b| (b.symbol.as_str(), b))
            .collect();
        let local = self.state.positions();

        let mut discrepancies = Vec::new();
        let mut actions = Vec::new();
        let mut matched = 0;

        for position in &local {
            match broker.get(position.symbol.as_str()) {
                None if !position.is_open() => {
                    // Flat leftover; nothing to disagree about.
                    self.state.remove_position(&position.symbol);
                    debug!(symbol = %position.symbol, "Dropped flat local record");
                }
                None => {
                    self.state.remove_position(&position.symbol);
                    actions.push(format!(
                        "removed {} qty {}: closed during downtime",
                        position.symbol, position.quantity
                    ));
                    discrepancies.push(PositionDiscrepancy {
                        symbol: position.symbol.clone(),
                        kind: DiscrepancyKind::BotOnly,
                        broker_quantity: None,
                        broker_avg_price: None,
                        bot_quantity: Some(position.quantity),
                        bot_avg_price: Some(position.entry_price),
                        resolution: DiscrepancyResolution::RemovedClosedDuringDowntime,
                    });
                }
                Some(b) if b.quantity != position.quantity => {
                    self.overwrite(position, b);
                    actions.push(format!(
                        "overwrote {} qty {} -> {}",
                        position.symbol, position.quantity, b.quantity
                    ));
                    discrepancies.push(PositionDiscrepancy {
                        symbol: position.symbol.clone(),
                        kind: DiscrepancyKind::QuantityMismatch,
                        broker_quantity: Some(b.quantity),
                        broker_avg_price: Some(b.average_price),
                        bot_quantity: Some(position.quantity),
                        bot_avg_price: Some(position.entry_price),
                        resolution: DiscrepancyResolution::OverwrittenFromBroker,
                    });
                }
                Some(_) => matched += 1,
            }
        }

        for (symbol, b) in &broker {
            if local.iter().any(|p| p.symbol == *symbol) {
                continue;
            }
            self.state
                .upsert_position(Position::adopted(b, &self.adopted_strategy_id, now));
            actions.push(format!(
                "adopted {} qty {}: opened during downtime",
                symbol, b.quantity
            ));
            discrepancies.push(PositionDiscrepancy {
                symbol: (*symbol).to_string(),
                kind: DiscrepancyKind::BrokerOnly,
                broker_quantity: Some(b.quantity),
                broker_avg_price: Some(b.average_price),
                bot_quantity: None,
                bot_avg_price: None,
                resolution: DiscrepancyResolution::AdoptedFromBroker,
            });
        }

        for d in &discrepancies {
            metrics::record_discrepancy(d.kind.as_str());
            warn!(
                symbol = %d.symbol,
                kind = d.kind.as_str(),
                broker_qty = ?d.broker_quantity,
                bot_qty = ?d.bot_quantity,
                "Position discrepancy resolved in broker's favor"
            );
        }

        let result = PositionReconciliationResult {
            timestamp: now,
            bot_positions: local.iter().filter(|p| p.is_open()).count(),
            broker_positions: broker.len(),
            matched,
            discrepancies,
            actions_taken: actions,
        };

        info!(
            bot_positions = result.bot_positions,
            broker_positions = result.broker_positions,
            matched = result.matched,
            discrepancies = result.discrepancies.len(),
            "Position reconciliation complete"
        );

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(&result) {
                warn!(error = %e, "Failed to append reconciliation audit record");
            }
        }

        result
    }

    fn overwrite(&self, position: &Position, broker: &BrokerPosition) {
        let side_flipped = position.side() != PositionSide::of(broker.quantity);
        self.state.update_position(&position.symbol, |p| {
            p.quantity = broker.quantity;
            p.entry_price = broker.average_price;
            p.unrealized_pnl = broker.unrealized_pnl;
            // Protective legs on the wrong side of a flipped position are useless.
            if side_flipped {
                p.stop_order_id = None;
                p.target_order_id = None;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedBroker {
        positions: Vec<BrokerPosition>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl BrokerPositionProvider for FixedBroker {
        async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.positions.clone())
        }
    }

    struct DownBroker;

    #[async_trait]
    impl BrokerPositionProvider for DownBroker {
        async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
            Err(BrokerError::ConnectionError {
                message: "connection refused".to_string(),
            })
        }
    }

    fn broker_position(symbol: &str, quantity: Decimal, price: Decimal) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.to_string(),
            quantity,
            average_price: price,
            unrealized_pnl: Decimal::ZERO,
            last_update: Utc::now(),
        }
    }

    fn reconciler(
        broker: Arc<dyn BrokerPositionProvider>,
        state: Arc<TradingState>,
    ) -> PositionReconciler {
        PositionReconciler::new(
            broker,
            state,
            Arc::new(ManualClock::new(Utc::now())),
            "recovered",
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_quantity_mismatch_takes_broker_quantity() {
        let state = Arc::new(TradingState::new());
        state.upsert_position(Position::new("ES", dec!(1), dec!(5000), Utc::now(), "orb"));
        let broker = Arc::new(FixedBroker {
            positions: vec![broker_position("ES", dec!(2), dec!(5001.5))],
            calls: AtomicU32::new(0),
        });

        let result = reconciler(broker.clone(), state.clone()).reconcile().await.unwrap();

        assert_eq!(result.discrepancies.len(), 1);
        assert_eq!(result.count_of(DiscrepancyKind::QuantityMismatch), 1);
        let es = state.position("ES").unwrap();
        assert_eq!(es.quantity, dec!(2));
        assert_eq!(es.entry_price, dec!(5001.5));
        assert_eq!(es.strategy_id, "orb");
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bot_only_position_removed() {
        let state = Arc::new(TradingState::new());
        state.upsert_position(Position::new("NQ", dec!(-1), dec!(18000), Utc::now(), "orb"));
        let broker = Arc::new(FixedBroker {
            positions: vec![broker_position("NQ", dec!(0), dec!(0))],
            calls: AtomicU32::new(0),
        });

        let result = reconciler(broker, state.clone()).reconcile().await.unwrap();

        assert_eq!(result.count_of(DiscrepancyKind::BotOnly), 1);
        assert!(state.position("NQ").is_none());
    }

    #[tokio::test]
    async fn test_flat_local_record_is_not_a_discrepancy() {
        let state = Arc::new(TradingState::new());
        state.upsert_position(Position::new("CL", dec!(0), dec!(75), Utc::now(), "orb"));
        let broker = Arc::new(FixedBroker {
            positions: Vec::new(),
            calls: AtomicU32::new(0),
        });

        let result = reconciler(broker, state.clone()).reconcile().await.unwrap();

        assert!(result.is_clean());
        assert_eq!(result.bot_positions, 0);
        assert!(result.actions_taken.is_empty());
        assert!(state.position("CL").is_none());
    }

    #[tokio::test]
    async fn test_broker_only_position_adopted() {
        let state = Arc::new(TradingState::new());
        let broker = Arc::new(FixedBroker {
            positions: vec![broker_position("MES", dec!(3), dec!(5010))],
            calls: AtomicU32::new(0),
        });

        let result = reconciler(broker, state.clone()).reconcile().await.unwrap();

        assert_eq!(result.count_of(DiscrepancyKind::BrokerOnly), 1);
        let adopted = state.position("MES").unwrap();
        assert_eq!(adopted.quantity, dec!(3));
        assert_eq!(adopted.strategy_id, "recovered");
    }

    #[tokio::test]
    async fn test_agreement_is_clean() {
        let state = Arc::new(TradingState::new());
        state.upsert_position(Position::new("ES", dec!(1), dec!(5000), Utc::now(), "orb"));
        let broker = Arc::new(FixedBroker {
            positions: vec![broker_position("ES", dec!(1), dec!(5000))],
            calls: AtomicU32::new(0),
        });

        let result = reconciler(broker, state).reconcile().await.unwrap();
        assert!(result.is_clean());
        assert_eq!(result.matched, 1);
    }

    #[tokio::test]
    async fn test_side_flip_clears_protective_legs() {
        let state = Arc::new(TradingState::new());
        let mut es = Position::new("ES", dec!(1), dec!(5000), Utc::now(), "orb");
        es.stop_order_id = Some("stop-1".to_string());
        state.upsert_position(es);
        let broker = Arc::new(FixedBroker {
            positions: vec![broker_position("ES", dec!(-1), dec!(4995))],
            calls: AtomicU32::new(0),
        });

        reconciler(broker, state.clone()).reconcile().await.unwrap();
        assert!(state.position("ES").unwrap().stop_order_id.is_none());
    }

    #[tokio::test]
    async fn test_broker_failure_is_transient() {
        let state = Arc::new(TradingState::new());
        let Err(err) = reconciler(Arc::new(DownBroker), state).reconcile().await else {
            panic!("expected broker failure");
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_result_appended_to_audit_log() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(TradingState::new());
        let broker = Arc::new(FixedBroker {
            positions: vec![broker_position("ES", dec!(1), dec!(5000))],
            calls: AtomicU32::new(0),
        });
        let audit_path = dir.path().join("reconciliation_audit.jsonl");

        reconciler(broker, state)
            .with_audit_log(JsonlLog::new(&audit_path))
            .reconcile()
            .await
            .unwrap();

        let records: Vec<PositionReconciliationResult> =
            JsonlLog::new(&audit_path).read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count_of(DiscrepancyKind::BrokerOnly), 1);
    }
}

//! The persisted state document.
//!
//! Maps are `BTreeMap`s so the serialized form is deterministic and the
//! checkpoint hash is stable across runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{PendingOrder, Position, StrategyState};

/// Account-level risk figures carried across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskMetrics {
    /// Realized plus unrealized P&L for the session.
    #[serde(rename = "dailyPnL")]
    pub daily_pnl: Decimal,
    /// Realized P&L for the session.
    #[serde(rename = "realizedPnL")]
    pub realized_pnl: Decimal,
    /// Largest peak-to-trough drawdown seen this session.
    pub max_drawdown: Decimal,
    /// Consecutive losing trades.
    pub consecutive_losses: u32,
}

/// Last known market context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketState {
    /// Last trade price per symbol.
    pub last_prices: BTreeMap<String, Decimal>,
    /// When the prices were last refreshed.
    pub updated_at: Option<DateTime<Utc>>,
}

/// A point-in-time copy of everything needed to resume trading.
///
/// A missing or `null` `positions` field fails decoding, so a snapshot that
/// decodes always carries a positions collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStateSnapshot {
    /// When the snapshot was captured.
    pub timestamp: DateTime<Utc>,
    /// Freshness marker used for downtime and staleness checks.
    pub last_updated: DateTime<Utc>,
    /// Open positions by symbol.
    pub positions: BTreeMap<String, Position>,
    /// Resting orders by order id.
    pub pending_orders: BTreeMap<String, PendingOrder>,
    /// Strategy enablement by strategy id.
    pub strategy_states: BTreeMap<String, StrategyState>,
    /// Account risk figures.
    pub risk_metrics: RiskMetrics,
    /// Market context.
    pub market_state: MarketState,
    /// Version of the engine that wrote the snapshot.
    pub system_version: String,
    /// Hex SHA-256 over the document with this field empty.
    pub checkpoint_hash: String,
}

/// Borrowed view of every hashed field.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashedContent<'a> {
    timestamp: &'a DateTime<Utc>,
    last_updated: &'a DateTime<Utc>,
    positions: &'a BTreeMap<String, Position>,
    pending_orders: &'a BTreeMap<String, PendingOrder>,
    strategy_states: &'a BTreeMap<String, StrategyState>,
    risk_metrics: &'a RiskMetrics,
    market_state: &'a MarketState,
    system_version: &'a str,
}

impl SystemStateSnapshot {
    /// Compute the checkpoint hash over the snapshot contents.
    pub fn compute_checkpoint_hash(&self) -> Result<String, serde_json::Error> {
        let content = HashedContent {
            timestamp: &self.timestamp,
            last_updated: &self.last_updated,
            positions: &self.positions,
            pending_orders: &self.pending_orders,
            strategy_states: &self.strategy_states,
            risk_metrics: &self.risk_metrics,
            market_state: &self.market_state,
            system_version: &self.system_version,
        };
        let bytes = serde_json::to_vec(&content)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Fill in the checkpoint hash.
    pub fn seal(&mut self) -> Result<(), serde_json::Error> {
        self.checkpoint_hash = self.compute_checkpoint_hash()?;
        Ok(())
    }

    /// Whether the stored hash matches the contents.
    #[must_use]
    pub fn hash_matches(&self) -> bool {
        !self.checkpoint_hash.is_empty()
            && self
                .compute_checkpoint_hash()
                .is_ok_and(|hash| hash == self.checkpoint_hash)
    }

    /// Number of open positions.
    #[must_use]
    pub fn open_position_count(&self) -> usize {
        self.positions.values().filter(|p| p.is_open()).count()
    }
}

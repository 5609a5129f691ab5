//! Strategy enablement records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a strategy may open new positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyState {
    /// Strategy identifier.
    pub strategy_id: String,
    /// Whether the strategy is allowed to trade.
    pub enabled: bool,
    /// Why the strategy was disabled, if it was.
    pub disabled_reason: Option<String>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl StrategyState {
    /// An enabled strategy.
    #[must_use]
    pub fn enabled(strategy_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            enabled: true,
            disabled_reason: None,
            updated_at: at,
        }
    }
}

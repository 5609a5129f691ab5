//! Protective order configuration: per-symbol stop and target distances.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Distances for one symbol, in price points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolProtection {
    /// Distance from the anchor price to the stop.
    pub stop_distance: f64,
    /// Distance from the anchor price to the target.
    pub target_distance: f64,
    /// Minimum price increment.
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
}

/// Protective order configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Stop distance for symbols without an entry in `symbols`.
    #[serde(default = "default_stop_distance")]
    pub default_stop_distance: f64,
    /// Target distance for symbols without an entry in `symbols`.
    #[serde(default = "default_target_distance")]
    pub default_target_distance: f64,
    /// Tick size for symbols without an entry in `symbols`.
    #[serde(default = "default_tick_size")]
    pub default_tick_size: f64,
    /// Per-symbol overrides.
    #[serde(default = "default_symbols")]
    pub symbols: BTreeMap<String, SymbolProtection>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            default_stop_distance: default_stop_distance(),
            default_target_distance: default_target_distance(),
            default_tick_size: default_tick_size(),
            symbols: default_symbols(),
        }
    }
}

/// Resolved distances for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionPolicy {
    /// Distance from the anchor price to the stop.
    pub stop_distance: Decimal,
    /// Distance from the anchor price to the target.
    pub target_distance: Decimal,
    /// Minimum price increment.
    pub tick_size: Decimal,
}

impl ProtectionPolicy {
    /// Round a price to the nearest tick.
    #[must_use]
    pub fn round_to_tick(&self, price: Decimal) -> Decimal {
        if self.tick_size.is_zero() {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}

impl ProtectionConfig {
    /// Distances for a symbol, falling back to the defaults.
    #[must_use]
    pub fn policy_for(&self, symbol: &str) -> ProtectionPolicy {
        let (stop, target, tick) = self.symbols.get(symbol).map_or(
            (
                self.default_stop_distance,
                self.default_target_distance,
                self.default_tick_size,
            ),
            |s| (s.stop_distance, s.target_distance, s.tick_size),
        );

        ProtectionPolicy {
            stop_distance: Decimal::try_from(stop).unwrap_or(Decimal::TEN),
            target_distance: Decimal::try_from(target).unwrap_or(Decimal::TWO * Decimal::TEN),
            tick_size: Decimal::try_from(tick).unwrap_or_else(|_| Decimal::new(25, 2)),
        }
    }
}

const fn default_stop_distance() -> f64 {
    10.0
}

const fn default_target_distance() -> f64 {
    20.0
}

const fn default_tick_size() -> f64 {
    0.25
}

fn default_symbols() -> BTreeMap<String, SymbolProtection> {
    let entry = |stop_distance, target_distance| SymbolProtection {
        stop_distance,
        target_distance,
        tick_size: 0.25,
    };
    BTreeMap::from([
        ("ES".to_string(), entry(10.0, 20.0)),
        ("MES".to_string(), entry(10.0, 20.0)),
        ("NQ".to_string(), entry(40.0, 80.0)),
        ("MNQ".to_string(), entry(40.0, 80.0)),
    ])
}

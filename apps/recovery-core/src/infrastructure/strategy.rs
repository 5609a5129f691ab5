//! Strategy controller backed by the shared trading state.
//!
//! Strategies read their enablement from [`TradingState`], so flipping the
//! flags there is enough to stop or resume signal generation. The change is
//! picked up by the next snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::ports::{StrategyControlError, StrategyController};
use crate::state::TradingState;

/// Enables and disables strategies through [`TradingState`].
#[derive(Debug)]
pub struct StateStrategyController {
    state: Arc<TradingState>,
    clock: Arc<dyn Clock>,
}

impl StateStrategyController {
    /// Create a controller over `state`.
    #[must_use]
    pub fn new(state: Arc<TradingState>, clock: Arc<dyn Clock>) -> Self {
        Self { state, clock }
    }
}

#[async_trait]
impl StrategyController for StateStrategyController {
    async fn disable_all(&self, reason: &str) -> Result<(), StrategyControlError> {
        let changed = self
            .state
            .set_all_strategies_enabled(false, Some(reason), self.clock.now());
        warn!(changed, reason = %reason, "All strategies disabled");
        Ok(())
    }

    async fn resume_all(&self) -> Result<(), StrategyControlError> {
        let changed = self
            .state
            .set_all_strategies_enabled(true, None, self.clock.now());
        info!(changed, "All strategies resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::StrategyState;
    use chrono::Utc;

    #[tokio::test]
    async fn test_disable_and_resume() {
        let state = Arc::new(TradingState::new());
        state.upsert_strategy(StrategyState::enabled("orb", Utc::now()));
        state.upsert_strategy(StrategyState::enabled("vwap", Utc::now()));
        let controller = StateStrategyController::new(state.clone(), Arc::new(SystemClock));

        controller.disable_all("heartbeat freeze").await.unwrap();
        assert!(state.all_strategies_disabled());
        assert!(
            state
                .strategies()
                .iter()
                .all(|s| s.disabled_reason.as_deref() == Some("heartbeat freeze"))
        );

        controller.resume_all().await.unwrap();
        assert!(state.strategies().iter().all(|s| s.enabled));
        assert!(state.strategies().iter().all(|s| s.disabled_reason.is_none()));
    }
}

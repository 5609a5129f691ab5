//! Strategy control and operator alerting ports.

use async_trait::async_trait;

use crate::error::{Classify, ErrorKind};

/// Failure to change strategy enablement.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Strategy control failed: {message}")]
pub struct StrategyControlError {
    /// Error details.
    pub message: String,
}

impl Classify for StrategyControlError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// Port for enabling and disabling signal generation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StrategyController: Send + Sync {
    /// Stop every strategy from opening new positions.
    async fn disable_all(&self, reason: &str) -> Result<(), StrategyControlError>;

    /// Allow every strategy to trade again.
    async fn resume_all(&self) -> Result<(), StrategyControlError>;
}

/// Failure to deliver an operator alert.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// The alert destination could not be written.
    #[error("Alert sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable operator alert channel.
///
/// Synchronous so it can be used from the panic path, and independent of
/// the structured logging pipeline.
#[cfg_attr(test, mockall::automock)]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert.
    fn send(&self, message: &str) -> Result<(), AlertError>;
}

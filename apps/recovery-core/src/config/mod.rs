//! Configuration module for the recovery core.
//!
//! Provides configuration loading, validation, and environment variable
//! interpolation for all recovery components. Every numeric threshold the
//! components use comes from here and has a tunable default.
//!
//! # Usage
//!
//! ```rust,ignore
//! use recovery_core::config::{Config, load_config};
//!
//! // Load from default path (recovery.yaml, or $RECOVERY_CONFIG)
//! let config = load_config(None)?;
//!
//! // Load from custom path
//! let config = load_config(Some("custom/recovery.yaml"))?;
//!
//! println!("downtime threshold: {:?}", config.recovery.downtime_threshold());
//! ```

mod emergency;
mod escalation;
mod heartbeat;
mod observability;
mod persistence;
mod protection;
mod recovery;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use emergency::EmergencyConfig;
pub use escalation::{EscalationConfig, LevelPolicy};
pub use heartbeat::HeartbeatConfig;
pub use observability::{LoggingConfig, MetricsSettings, ObservabilityConfig};
pub use persistence::PersistenceConfig;
pub use protection::{ProtectionConfig, ProtectionPolicy, SymbolProtection};
pub use recovery::RecoveryConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_PATH: &str = "recovery.yaml";

/// Environment variable that overrides the configuration path.
pub const CONFIG_PATH_ENV: &str = "RECOVERY_CONFIG";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Snapshot storage.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Startup crash recovery.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Protective stop/target placement.
    #[serde(default)]
    pub protection: ProtectionConfig,
    /// Emergency liquidation and fault handling.
    #[serde(default)]
    pub emergency: EmergencyConfig,
    /// Liveness monitoring.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Stuck-position escalation.
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================
// Configuration Loading
// ============================================

/// Path to load configuration from: explicit argument, then
/// `$RECOVERY_CONFIG`, then `recovery.yaml`.
#[must_use]
pub fn resolve_config_path(path: Option<&str>) -> String {
    path.map(str::to_string)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().filter(|p| !p.is_empty()))
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Load configuration from a YAML file with environment variable interpolation.
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = resolve_config_path(path);

    let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
        path: path.clone(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string (useful for testing).
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax.
#[allow(clippy::expect_used)] // Regex is compile-time constant; expect() is safe here
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let var_name = cap.get(1).map_or("", |m| m.as_str());
        let default_value = cap.get(2).map(|m| m.as_str());

        match std::env::var(var_name) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.map_or_else(String::new, str::to_string),
        }
    })
    .into_owned()
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

/// Validate configuration values.
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` naming the first offending field.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let persistence = &config.persistence;
    if persistence.snapshot_interval_ms == 0 {
        return Err(invalid("persistence.snapshot_interval_ms must be positive"));
    }
    if persistence.max_state_age_secs == 0 {
        return Err(invalid("persistence.max_state_age_secs must be positive"));
    }
    if persistence.system_version.trim().is_empty() {
        return Err(invalid("persistence.system_version must not be empty"));
    }

    if config.recovery.downtime_threshold_ms == 0 {
        return Err(invalid("recovery.downtime_threshold_ms must be positive"));
    }
    if config.recovery.operation_deadline_secs == 0 {
        return Err(invalid("recovery.operation_deadline_secs must be positive"));
    }

    let protection = &config.protection;
    let distances = std::iter::once((
        "default",
        protection.default_stop_distance,
        protection.default_target_distance,
        protection.default_tick_size,
    ))
    .chain(protection.symbols.iter().map(|(symbol, s)| {
        (
            symbol.as_str(),
            s.stop_distance,
            s.target_distance,
            s.tick_size,
        )
    }));
    for (symbol, stop, target, tick) in distances {
        if stop <= 0.0 || target <= 0.0 || tick <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "protection distances for {symbol} must be positive"
            )));
        }
    }

    let emergency = &config.emergency;
    if emergency.liquidation_deadline_secs == 0 || emergency.order_timeout_ms == 0 {
        return Err(invalid("emergency deadlines must be positive"));
    }
    if emergency.backup_limit_offset_pct < 0.0 || emergency.backup_limit_offset_pct >= 1.0 {
        return Err(invalid(
            "emergency.backup_limit_offset_pct must be between 0.0 and 1.0",
        ));
    }

    let heartbeat = &config.heartbeat;
    if heartbeat.check_interval_ms == 0 {
        return Err(invalid("heartbeat.check_interval_ms must be positive"));
    }
    if heartbeat.stale_after_ms >= heartbeat.escalate_after_ms {
        return Err(invalid(
            "heartbeat.stale_after_ms must be less than heartbeat.escalate_after_ms",
        ));
    }
    if heartbeat.stale_after_ms + heartbeat.grace_period_ms > heartbeat.escalate_after_ms {
        return Err(invalid(
            "heartbeat grace period must end before heartbeat.escalate_after_ms",
        ));
    }
    if heartbeat.worker_floor == 0 || heartbeat.worker_floor > heartbeat.max_workers {
        return Err(invalid(
            "heartbeat.worker_floor must be between 1 and heartbeat.max_workers",
        ));
    }

    let escalation = &config.escalation;
    if escalation.poll_interval_ms == 0 {
        return Err(invalid("escalation.poll_interval_ms must be positive"));
    }
    for (name, level) in [
        ("smart_retry", escalation.smart_retry),
        ("fresh_start", escalation.fresh_start),
        ("market_order", escalation.market_order),
    ] {
        if level.max_attempts == 0 || level.window_secs == 0 {
            return Err(ConfigError::ValidationError(format!(
                "escalation.{name} needs at least one attempt and a non-zero window"
            )));
        }
    }
    if escalation.runaway_loss_threshold == 0.0 {
        return Err(invalid("escalation.runaway_loss_threshold must be non-zero"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.recovery.downtime_threshold(), Duration::from_secs(60));
        assert_eq!(config.heartbeat.escalate_after(), Duration::from_secs(35));
    }

    #[test]
    fn test_load_empty_config_uses_defaults() {
        let config = match load_config_from_string("{}") {
            Ok(c) => c,
            Err(e) => panic!("should load empty config: {e}"),
        };
        assert_eq!(config.persistence.snapshot_interval_ms, 100);
        assert_eq!(config.escalation.smart_retry.max_attempts, 3);
    }

    #[test]
    fn test_env_var_with_default_when_missing() {
        let input = "dir: ${RECOVERY_CONFIG_TEST_NONEXISTENT_VAR:-./state}";
        let result = interpolate_env_vars(input);
        assert_eq!(result, "dir: ./state");
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)] // ${...} is env var syntax, not format args
    fn test_env_var_with_default_uses_existing() {
        let input = "path: ${PATH:-default}";
        let result = interpolate_env_vars(input);
        assert_ne!(result, "path: default");
        assert!(result.starts_with("path: "));
    }

    #[test]
    fn test_env_var_without_default_becomes_empty() {
        let input = "dir: ${RECOVERY_CONFIG_TEST_UNLIKELY_TO_EXIST}";
        assert_eq!(interpolate_env_vars(input), "dir: ");
    }

    #[test]
    fn test_validation_rejects_grace_past_escalation() {
        let yaml = r"
heartbeat:
  stale_after_ms: 10000
  grace_period_ms: 30000
  escalate_after_ms: 35000
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for grace period past escalation");
        };
        assert!(err.to_string().contains("grace period"));
    }

    #[test]
    fn test_validation_rejects_zero_snapshot_interval() {
        let yaml = r"
persistence:
  snapshot_interval_ms: 0
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for zero snapshot interval");
        };
        assert!(err.to_string().contains("snapshot_interval_ms"));
    }

    #[test]
    fn test_validation_rejects_negative_distance() {
        let yaml = r"
protection:
  symbols:
    ES:
      stop_distance: -4.0
      target_distance: 8.0
";
        let Err(err) = load_config_from_string(yaml) else {
            panic!("expected error for negative stop distance");
        };
        assert!(err.to_string().contains("ES"));
    }

    #[test]
    fn test_full_config_parse() {
        let yaml = r#"
persistence:
  state_dir: "/var/lib/recovery"
  snapshot_interval_ms: 250
recovery:
  downtime_threshold_ms: 90000
protection:
  default_stop_distance: 5.0
  default_target_distance: 12.5
  symbols:
    CL:
      stop_distance: 0.5
      target_distance: 1.0
      tick_size: 0.01
emergency:
  liquidation_deadline_secs: 10
heartbeat:
  check_interval_ms: 1000
escalation:
  strategy_max_hold_minutes:
    orb: 45
  smart_retry:
    max_attempts: 4
    window_secs: 40
    retry_interval_secs: 5
observability:
  logging:
    level: debug
    format: pretty
  metrics:
    enabled: true
    listen_addr: "127.0.0.1:9191"
"#;

        let config = match load_config_from_string(yaml) {
            Ok(c) => c,
            Err(e) => panic!("should parse full config: {e}"),
        };

        assert_eq!(config.persistence.state_dir, "/var/lib/recovery");
        assert_eq!(config.recovery.downtime_threshold(), Duration::from_secs(90));
        assert!(config.protection.symbols.contains_key("CL"));
        assert_eq!(config.emergency.liquidation_deadline_secs, 10);
        assert_eq!(config.heartbeat.check_interval(), Duration::from_secs(1));
        assert_eq!(config.escalation.max_hold_for("orb"), Duration::from_secs(45 * 60));
        assert_eq!(config.escalation.smart_retry.max_attempts, 4);
        assert_eq!(config.observability.logging.format, "pretty");
        assert!(config.observability.metrics.enabled);
    }

    #[test]
    fn test_resolve_config_path_prefers_argument() {
        assert_eq!(resolve_config_path(Some("a.yaml")), "a.yaml");
    }
}

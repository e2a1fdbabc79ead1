use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    /// Root directory of the durable record store
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub aft: AftSettings,
}

fn default_data_dir() -> String {
    "./data/aft".to_string()
}

/// Host-configurable AFT behavior. All money values are in cents.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AftSettings {
    /// Machine asset number; zero means "not configured"
    pub asset_number: u32,
    /// Per-transfer ceiling
    pub transfer_limit: u64,
    /// Bank credit ceiling, bounds transfer-on room
    pub credit_limit: u64,
    /// Hard cash-out lockup suppression threshold
    pub max_payout_limit: u64,

    pub transfer_on_enabled: bool,
    pub transfer_off_enabled: bool,
    pub bonus_enabled: bool,
    pub debit_transfers_allowed: bool,
    pub partial_transfers_allowed: bool,

    pub lock_exception_interval_ms: u64,
    pub completion_exception_interval_ms: u64,
    pub host_cashout_exception_interval_ms: u64,
    pub registration_exception_interval_ms: u64,

    /// Bounded wait for the host to answer a cash-out request
    pub host_cashout_wait_ms: u64,
    /// Short acquisition timeout for the hard cash-out handle
    pub hard_cashout_request_timeout_ms: u64,
    /// How long an orchestrator queues for the exclusive handle
    pub transfer_handle_timeout_ms: u64,
    /// How long a recovered transfer waits for the wallet to re-deliver it
    pub recovery_timeout_ms: u64,

    /// Completed transfers kept for duplicate detection (SAS allows 1..=127)
    pub history_capacity: usize,
}

impl Default for AftSettings {
    fn default() -> Self {
        Self {
            asset_number: 0,
            transfer_limit: 10_000_000,
            credit_limit: 100_000_000,
            max_payout_limit: 120_000,
            transfer_on_enabled: true,
            transfer_off_enabled: true,
            bonus_enabled: true,
            debit_transfers_allowed: false,
            partial_transfers_allowed: true,
            lock_exception_interval_ms: 5_000,
            completion_exception_interval_ms: 15_000,
            host_cashout_exception_interval_ms: 800,
            registration_exception_interval_ms: 5_000,
            host_cashout_wait_ms: 8_000,
            hard_cashout_request_timeout_ms: 1_000,
            transfer_handle_timeout_ms: 5_000,
            recovery_timeout_ms: 30_000,
            history_capacity: 127,
        }
    }
}

impl AftSettings {
    pub fn lock_exception_interval(&self) -> Duration {
        Duration::from_millis(self.lock_exception_interval_ms)
    }

    pub fn completion_exception_interval(&self) -> Duration {
        Duration::from_millis(self.completion_exception_interval_ms)
    }

    pub fn host_cashout_exception_interval(&self) -> Duration {
        Duration::from_millis(self.host_cashout_exception_interval_ms)
    }

    pub fn registration_exception_interval(&self) -> Duration {
        Duration::from_millis(self.registration_exception_interval_ms)
    }

    pub fn host_cashout_wait(&self) -> Duration {
        Duration::from_millis(self.host_cashout_wait_ms)
    }

    pub fn hard_cashout_request_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_cashout_request_timeout_ms)
    }

    pub fn transfer_handle_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_handle_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_limit == 0 {
            return Err(ConfigError::Invalid("transfer_limit must be non-zero".to_string()));
        }
        if self.history_capacity == 0 || self.history_capacity > 127 {
            return Err(ConfigError::Invalid(format!(
                "history_capacity must be 1..=127, got {}",
                self.history_capacity
            )));
        }
        if self.host_cashout_exception_interval_ms == 0
            || self.lock_exception_interval_ms == 0
            || self.completion_exception_interval_ms == 0
            || self.registration_exception_interval_ms == 0
        {
            return Err(ConfigError::Invalid(
                "exception intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.aft.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
log_level: info
log_dir: ./logs
log_file: aft.log
use_json: false
rotation: daily
enable_tracing: false
aft:
  asset_number: 1234
  transfer_limit: 50000
  debit_transfers_allowed: true
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = AppConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.aft.asset_number, 1234);
        assert_eq!(config.aft.transfer_limit, 50_000);
        assert!(config.aft.debit_transfers_allowed);
        assert_eq!(config.aft.host_cashout_wait(), Duration::from_secs(8));
        assert_eq!(config.aft.history_capacity, 127);
        assert_eq!(config.data_dir, "./data/aft");
    }

    #[test]
    fn test_invalid_history_capacity() {
        let yaml = YAML.replace("debit_transfers_allowed: true", "history_capacity: 0");
        assert!(matches!(
            AppConfig::from_yaml_str(&yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_transfer_limit_rejected() {
        let yaml = YAML.replace("transfer_limit: 50000", "transfer_limit: 0");
        assert!(matches!(
            AppConfig::from_yaml_str(&yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_asset_number_is_allowed() {
        let yaml = YAML.replace("  asset_number: 1234\n", "");
        let config = AppConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.aft.asset_number, 0);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AppConfig::load("does-not-exist"),
            Err(ConfigError::Read { .. })
        ));
    }
}

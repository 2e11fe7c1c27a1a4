//! Configuration for Mailforge

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Quota enforcement configuration
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Credential pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Sending pace defaults
    #[serde(default)]
    pub sending: SendingConfig,

    /// Outbound SMTP configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the state snapshot and lock files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/mailforge")
}

/// Quota enforcement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Daily cap applied to unlimited-plan users as a system-wide fallback
    #[serde(default = "default_system_daily_cap")]
    pub system_daily_cap: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            system_daily_cap: default_system_daily_cap(),
        }
    }
}

fn default_system_daily_cap() -> i64 {
    2000
}

/// Credential pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Rotation strategy: "round_robin", "random" or "weighted_random"
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Initial cooldown duration in seconds
    #[serde(default = "default_cooldown_floor_secs")]
    pub cooldown_floor_secs: u64,

    /// Maximum cooldown duration in seconds
    #[serde(default = "default_cooldown_ceiling_secs")]
    pub cooldown_ceiling_secs: u64,

    /// Consecutive failures before a credential is cooled down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Suspicion score at which a credential is cooled down
    #[serde(default = "default_suspicion_threshold")]
    pub suspicion_threshold: u32,

    /// Cooldown applications without an intervening success after which a
    /// credential is treated as permanently broken and removed
    #[serde(default = "default_removal_threshold")]
    pub removal_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            cooldown_floor_secs: default_cooldown_floor_secs(),
            cooldown_ceiling_secs: default_cooldown_ceiling_secs(),
            failure_threshold: default_failure_threshold(),
            suspicion_threshold: default_suspicion_threshold(),
            removal_threshold: default_removal_threshold(),
        }
    }
}

fn default_strategy() -> String {
    "weighted_random".to_string()
}

fn default_cooldown_floor_secs() -> u64 {
    300 // 5 minutes
}

fn default_cooldown_ceiling_secs() -> u64 {
    1800 // 30 minutes
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_suspicion_threshold() -> u32 {
    5
}

fn default_removal_threshold() -> u32 {
    3
}

/// Sending pace defaults, used when a campaign supplies no options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingConfig {
    /// Recipients processed per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between individual sends in milliseconds
    #[serde(default = "default_email_delay_ms")]
    pub email_delay_ms: u64,

    /// Delay between batches in milliseconds
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            email_delay_ms: default_email_delay_ms(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_email_delay_ms() -> u64 {
    1500
}

fn default_batch_delay_ms() -> u64 {
    5000
}

/// Outbound SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Per-send deadline in seconds at the transport boundary
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

fn default_send_timeout_secs() -> u64 {
    10
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations, falling back to
    /// built-in defaults when no file is present.
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./mailforge.toml"),
            std::path::PathBuf::from("/etc/mailforge/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }
}

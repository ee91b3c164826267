//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CATLET_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CATLET";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CATLET_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Controller process settings.
    pub controller: ControllerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Retry policy for transient handler failures.
    pub retry: RetryConfig,
    /// Lease lock settings.
    pub lock: LockConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig {
                storage_type: StorageType::Memory,
                ..StorageConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Controller process settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Agent name the controller reports when it accepts saga tasks.
    pub name: String,
    /// Upper bound on concurrently running message handlers.
    pub max_concurrent_handlers: usize,
    /// Deadline for an agent task to reach a terminal state.
    pub task_deadline_secs: u64,
    /// Bound on waiting for a distributed lock.
    pub lock_timeout_secs: u64,
    /// How often the deadline scheduler polls for expired tasks.
    pub deadline_check_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            max_concurrent_handlers: 16,
            task_deadline_secs: 30 * 60,
            lock_timeout_secs: 30,
            deadline_check_interval_ms: 5_000,
        }
    }
}

impl ControllerConfig {
    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.task_deadline_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn deadline_check_interval(&self) -> Duration {
        Duration::from_millis(self.deadline_check_interval_ms)
    }
}

/// Storage type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// In-memory stores. State is lost on restart.
    Memory,
    /// SQLite file database.
    #[default]
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// Database file path (SQLite).
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Sqlite,
            path: "./data/catlet.db".to_string(),
        }
    }
}

/// Retry policy for transient handler failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts after the first one before dead-lettering.
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 2_000,
            max_retries: 10,
        }
    }
}

/// Lease lock settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease lifetime. Must exceed the longest unit of work.
    pub lease_ttl_secs: u64,
    /// Delay between acquisition attempts while a lock is held elsewhere.
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 120,
            poll_interval_ms: 50,
        }
    }
}

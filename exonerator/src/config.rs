use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete configuration for the importer and the query engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExoneratorConfig {
    /// Fact database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Descriptor import settings
    #[serde(default)]
    pub import: ImportConfig,

    /// Query settings
    #[serde(default)]
    pub query: QueryConfig,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Connection pool size
    #[serde(default = "default_db_pool_size")]
    pub pool_size: u32,

    /// Enable WAL mode so queries are not blocked by a running import
    #[serde(default = "default_enable_wal")]
    pub enable_wal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Directory holding consensus and exit list files, searched recursively
    #[serde(default = "default_import_directory")]
    pub directory: PathBuf,

    /// File remembering which descriptor files were already imported
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,

    /// Marker file preventing concurrent import runs
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Age after which a lock file is considered left behind by a crashed run
    #[serde(default = "default_lock_stale_hours")]
    pub lock_stale_hours: u64,

    /// Abort the run when a relay address cannot be canonicalized
    #[serde(default = "default_abort_on_invalid_address")]
    pub abort_on_invalid_address: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Dates later than this many days before today are rejected as too recent
    #[serde(default = "default_reject_recent_days")]
    pub reject_recent_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Collect Prometheus metrics and log them after each import
    #[serde(default = "default_enable_metrics")]
    pub enabled: bool,
}

// Default value functions
fn default_db_path() -> PathBuf {
    PathBuf::from("exonerator.db")
}

fn default_db_pool_size() -> u32 {
    4
}

fn default_enable_wal() -> bool {
    true
}

fn default_import_directory() -> PathBuf {
    PathBuf::from("in")
}

fn default_history_file() -> PathBuf {
    PathBuf::from("stats/exonerator-import-history")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("exonerator-lock")
}

fn default_lock_stale_hours() -> u64 {
    6
}

fn default_abort_on_invalid_address() -> bool {
    true
}

fn default_reject_recent_days() -> u32 {
    2
}

fn default_enable_metrics() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path(), pool_size: default_db_pool_size(), enable_wal: default_enable_wal() }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            directory: default_import_directory(),
            history_file: default_history_file(),
            lock_file: default_lock_file(),
            lock_stale_hours: default_lock_stale_hours(),
            abort_on_invalid_address: default_abort_on_invalid_address(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { reject_recent_days: default_reject_recent_days() }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: default_enable_metrics() }
    }
}

impl ExoneratorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ExoneratorConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.pool_size == 0 {
            return Err(ConfigError::ValidationError("pool_size must be > 0".to_string()));
        }

        if self.import.directory.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError("import directory cannot be empty".to_string()));
        }

        if self.import.history_file.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError("history_file cannot be empty".to_string()));
        }

        if self.import.lock_stale_hours == 0 {
            return Err(ConfigError::ValidationError("lock_stale_hours must be > 0".to_string()));
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Create a default configuration file
    pub fn create_default_config_file(path: &Path) -> Result<(), ConfigError> {
        Self::default().save_to_file(path)
    }
}

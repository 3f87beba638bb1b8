//! Daemon configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `PARKD_*` environment variables. The binary applies its CLI flags last.
//!
//! ```toml
//! socket_path = "/tmp/parkd.sock"
//! reservation_expiry_secs = 60
//! sweep_interval_secs = 300
//! default_section = "A"
//! log_level = "info"
//!
//! [storage]
//! backend = "sqlite"
//! path = "/var/lib/parkd/parkingspaces.db"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::coordinator::{CoordinatorSettings, DEFAULT_SECTION};
use crate::server::DEFAULT_SOCKET_PATH;
use crate::storage::{Database, MemoryDatabase, SqliteDatabase, StorageError};

/// Upper bound for the reservation window (one day).
pub const MAX_RESERVATION_EXPIRY_SECS: u64 = 86_400;

const DEFAULT_RESERVATION_EXPIRY_SECS: u64 = 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Where space records live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Lost on restart
    Memory,
    Sqlite { path: PathBuf },
}

impl StorageConfig {
    /// `<state dir>/parkd/parkingspaces.db`, under `/tmp` if the platform
    /// has no state directory.
    pub fn default_sqlite_path() -> PathBuf {
        dirs::state_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("parkd")
            .join("parkingspaces.db")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: Self::default_sqlite_path(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,

    pub storage: StorageConfig,

    /// Age after which an unclaimed reservation is released
    pub reservation_expiry_secs: u64,

    /// Period of the expiry sweep
    pub sweep_interval_secs: u64,

    /// Section for spaces first seen through a sensor event
    pub default_section: String,

    /// Base level for the daemon's log targets
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            storage: StorageConfig::default(),
            reservation_expiry_secs: DEFAULT_RESERVATION_EXPIRY_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            default_section: DEFAULT_SECTION.to_string(),
            log_level: String::from("info"),
        }
    }
}

impl DaemonConfig {
    /// Loads a TOML file; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// `ConfigError::Read` or `ConfigError::Parse`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Applies `PARKD_*` environment variables.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up by variable name.
    ///
    /// - `PARKD_SOCKET`: socket path
    /// - `PARKD_DATABASE`: SQLite path, or `memory`
    /// - `PARKD_RESERVATION_EXPIRY_SECS`
    /// - `PARKD_SWEEP_INTERVAL_SECS`
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(socket) = lookup("PARKD_SOCKET") {
            self.socket_path = PathBuf::from(socket);
        }

        if let Some(database) = lookup("PARKD_DATABASE") {
            self.storage = if database.eq_ignore_ascii_case("memory") {
                StorageConfig::Memory
            } else {
                StorageConfig::Sqlite {
                    path: PathBuf::from(database),
                }
            };
        }

        if let Some(value) = lookup("PARKD_RESERVATION_EXPIRY_SECS") {
            self.reservation_expiry_secs = parse_secs("PARKD_RESERVATION_EXPIRY_SECS", &value)?;
        }

        if let Some(value) = lookup("PARKD_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse_secs("PARKD_SWEEP_INTERVAL_SECS", &value)?;
        }

        Ok(self)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reservation_expiry_secs == 0 {
            return Err(ConfigError::invalid(
                "reservation_expiry_secs",
                "must be greater than 0",
            ));
        }

        if self.reservation_expiry_secs > MAX_RESERVATION_EXPIRY_SECS {
            return Err(ConfigError::invalid(
                "reservation_expiry_secs",
                format!("must not exceed {MAX_RESERVATION_EXPIRY_SECS}"),
            ));
        }

        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "sweep_interval_secs",
                "must be greater than 0",
            ));
        }

        if self.default_section.trim().is_empty() {
            return Err(ConfigError::invalid("default_section", "must not be empty"));
        }

        Ok(())
    }

    pub fn reservation_expiry(&self) -> Duration {
        Duration::from_secs(self.reservation_expiry_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            expiry_window: self.reservation_expiry(),
            default_section: self.default_section.clone(),
        }
    }

    /// Opens the configured storage backend.
    pub fn open_database(&self) -> Result<Arc<dyn Database>, StorageError> {
        match &self.storage {
            StorageConfig::Memory => {
                info!("Using in-memory storage");
                Ok(Arc::new(MemoryDatabase::new()))
            }
            StorageConfig::Sqlite { path } => {
                info!(path = %path.display(), "Opening SQLite storage");
                Ok(Arc::new(SqliteDatabase::open(path)?))
            }
        }
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("'{value}' is not a number of seconds")))
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/parkd.sock"));
        assert_eq!(config.reservation_expiry(), Duration::from_secs(60));
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.default_section, "A");
        assert!(config.validate().is_ok());
        assert!(matches!(config.storage, StorageConfig::Sqlite { .. }));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DaemonConfig::from_toml(
            r#"
            reservation_expiry_secs = 120

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.reservation_expiry_secs, 120);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.sweep_interval_secs, 300);
    }

    #[test]
    fn test_sqlite_storage_from_toml() {
        let config = DaemonConfig::from_toml(
            r#"
            [storage]
            backend = "sqlite"
            path = "/var/lib/parkd/spaces.db"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: PathBuf::from("/var/lib/parkd/spaces.db")
            }
        );
    }

    #[test]
    fn test_invalid_toml() {
        let err = DaemonConfig::from_toml("reservation_expiry_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PARKD_SOCKET", "/run/parkd.sock"),
            ("PARKD_DATABASE", "memory"),
            ("PARKD_RESERVATION_EXPIRY_SECS", "90"),
        ]
        .into_iter()
        .collect();

        let config = DaemonConfig::default()
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/parkd.sock"));
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.reservation_expiry_secs, 90);
        assert_eq!(config.sweep_interval_secs, 300);
    }

    #[test]
    fn test_bad_env_override() {
        let err = DaemonConfig::default()
            .apply_overrides(|key| (key == "PARKD_SWEEP_INTERVAL_SECS").then(|| "often".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PARKD_SWEEP_INTERVAL_SECS"));
    }

    #[test]
    fn test_validate_rejects_zero_and_oversized_windows() {
        let mut config = DaemonConfig {
            reservation_expiry_secs: 0,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());

        config.reservation_expiry_secs = MAX_RESERVATION_EXPIRY_SECS + 1;
        assert!(config.validate().is_err());

        config.reservation_expiry_secs = 60;
        config.sweep_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sweep_interval_secs"));
    }

    #[test]
    fn test_coordinator_settings() {
        let config = DaemonConfig {
            reservation_expiry_secs: 30,
            default_section: "B".to_string(),
            ..DaemonConfig::default()
        };
        let settings = config.coordinator_settings();
        assert_eq!(settings.expiry_window, Duration::from_secs(30));
        assert_eq!(settings.default_section, "B");
    }

    #[test]
    fn test_memory_database_opens() {
        let config = DaemonConfig {
            storage: StorageConfig::Memory,
            ..DaemonConfig::default()
        };
        let db = config.open_database().unwrap();
        assert!(db.fetch_all_space_states().unwrap().is_empty());
    }
}

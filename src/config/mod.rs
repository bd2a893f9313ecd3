//! # Configuration
//!
//! TOML configuration for the world store and its command line tool.
//!
//! ## Configuration Structure
//!
//! - [`StoreConfig`] - whether the store is used at all, load error policy, file location
//! - [`LoggingConfig`] - log level and optional log file
//! - [`BackupConfig`] - backup directory, retention and pre-import snapshots
//!
//! ## Configuration File Format
//!
//! ```toml
//! [store]
//! enabled = true
//! ignore_load_errors = false
//! data_path = "./data"
//! file_name = "storage.db"
//! statement_cache = 64
//! check_integrity = true
//!
//! [logging]
//! level = "info"
//! file = "worldstore.log"
//!
//! [backup]
//! directory = "./backups"
//! keep = 10
//! before_import = true
//! ```
//!
//! Every field has a default, so a partial file (or an empty one) is valid.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// When false every store operation is a no-op.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Discard records that fail integrity checks on load instead of aborting.
    #[serde(default)]
    pub ignore_load_errors: bool,
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    /// Prepared statement cache capacity per connection.
    #[serde(default = "default_statement_cache")]
    pub statement_cache: usize,
    /// Run SQLite consistency checks when the store is opened.
    #[serde(default = "default_true")]
    pub check_integrity: bool,
}

fn default_true() -> bool {
    true
}

fn default_data_path() -> String {
    "./data".to_string()
}

fn default_file_name() -> String {
    "storage.db".to_string()
}

fn default_statement_cache() -> usize {
    64
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignore_load_errors: false,
            data_path: default_data_path(),
            file_name: default_file_name(),
            statement_cache: default_statement_cache(),
            check_integrity: true,
        }
    }
}

impl StoreConfig {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_path).join(&self.file_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: Some("worldstore.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub directory: String,
    /// Number of archives kept; zero keeps all.
    #[serde(default = "default_keep")]
    pub keep: usize,
    /// Snapshot the store before a bulk import replaces its contents.
    #[serde(default = "default_true")]
    pub before_import: bool,
}

fn default_backup_dir() -> String {
    "./backups".to_string()
}

fn default_keep() -> usize {
    10
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_dir(),
            keep: default_keep(),
            before_import: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content).map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.store.enabled);
        assert!(!config.store.ignore_load_errors);
        assert_eq!(config.store.statement_cache, 64);
        assert_eq!(config.backup.keep, 10);
        assert_eq!(
            config.store.database_path(),
            PathBuf::from("./data").join("storage.db")
        );
    }

    #[test]
    fn test_partial_store_section() {
        let config: Config = toml::from_str(
            "[store]\nenabled = false\nignore_load_errors = true\ndata_path = \"/srv/world\"\n",
        )
        .unwrap();
        assert!(!config.store.enabled);
        assert!(config.store.ignore_load_errors);
        assert_eq!(config.store.file_name, "storage.db");
        assert_eq!(
            config.store.database_path(),
            PathBuf::from("/srv/world/storage.db")
        );
    }

    #[test]
    fn test_create_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).unwrap();
        let config = Config::load(path).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file.as_deref(), Some("worldstore.log"));
        assert!(config.backup.before_import);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::load("/nonexistent/worldstore.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

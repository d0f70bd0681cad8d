//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_DATABASE: &str = "fleetping.sqlite";

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Registry database used when `--database` is not given
    pub database_path: Option<String>,
    /// Interval assigned to imported devices
    pub default_interval_secs: Option<u64>,
}

impl Config {
    /// Load configuration from the user config file, if any
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Pick the registry database: explicit flag or env, then config file, then default
    pub fn database(&self, explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| self.database_path.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE))
    }

    /// Get the configuration file path
    fn config_path() -> Option<PathBuf> {
        let home = dirs_next::home_dir()?;
        Some(home.join(".config").join("fleetping").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert!(config.database_path.is_none());
        assert_eq!(config.database(None), PathBuf::from("fleetping.sqlite"));
    }

    #[test]
    fn test_database_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"database_path": "/var/lib/fleetping/registry.sqlite"}"#)
            .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(
            config.database(None),
            PathBuf::from("/var/lib/fleetping/registry.sqlite")
        );
        assert_eq!(
            config.database(Some(PathBuf::from("local.sqlite"))),
            PathBuf::from("local.sqlite")
        );
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}

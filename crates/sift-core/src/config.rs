//! Configuration loading shared by every sift component.
//!
//! Configuration lives in a single TOML file. Each crate owns the section
//! describing itself; this module provides the `[general]` section and the
//! plumbing to read, write and override configuration values.
//!
//! # Location
//!
//! The file is resolved in this order:
//!
//! 1. an explicit path (the `--config` flag of the CLI)
//! 2. the `SIFT_CONFIG_PATH` environment variable
//! 3. `~/.sift/config.toml`
//!
//! Environment variables prefixed with `SIFT_` override file values after
//! loading.

use crate::error::{Result, SiftError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable prefix for all configuration overrides
pub const ENV_PREFIX: &str = "SIFT_";

pub const ENV_CONFIG_PATH: &str = "SIFT_CONFIG_PATH";
pub const ENV_LOG_LEVEL: &str = "SIFT_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "SIFT_LOG_FORMAT";
pub const ENV_DATA_DIR: &str = "SIFT_DATA_DIR";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = SiftError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(SiftError::config(format!("Unknown log format: {other}"))),
        }
    }
}

/// `[general]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log output format
    pub log_format: LogFormat,

    /// Directory for indexes, cache snapshots and result files
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            data_dir: default_base_dir(),
        }
    }
}

impl GeneralConfig {
    /// Apply `SIFT_*` environment overrides for this section.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(level) = env_override(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Some(format) = env_override(ENV_LOG_FORMAT) {
            self.log_format = format.parse()?;
        }
        if let Some(dir) = env_override(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Validate the section.
    pub fn validate(&self) -> Result<()> {
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(SiftError::config(format!("Invalid log level: {other}"))),
        }
    }
}

/// `~/.sift`, falling back to `./.sift` when no home directory is known.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sift")
}

/// Resolve the configuration file path without touching the filesystem.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = env_override(ENV_CONFIG_PATH) {
        return PathBuf::from(path);
    }
    default_base_dir().join("config.toml")
}

/// Read a non-empty environment override.
pub fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment override into `T`.
pub fn env_override_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_override(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| SiftError::config(format!("Invalid value for {name}: {e}"))),
        None => Ok(None),
    }
}

/// Load a TOML document from `path`.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Loading configuration from: {}", path.display());

    let content = std::fs::read_to_string(path)
        .map_err(|e| SiftError::config(format!("Failed to read {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| SiftError::config(format!("Failed to parse {}: {e}", path.display())))
}

/// Load a TOML document, or `T::default()` when the file does not exist.
pub fn load_toml_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if path.exists() {
        load_toml(path)
    } else {
        debug!("No configuration at {}, using defaults", path.display());
        Ok(T::default())
    }
}

/// Write `value` to `path` as TOML (temp file + rename).
pub fn save_toml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = toml::to_string_pretty(value)
        .map_err(|e| SiftError::config(format!("Failed to serialize config: {e}")))?;

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    info!("Configuration saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Sample {
        general: GeneralConfig,
        name: String,
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut sample = Sample::default();
        sample.name = "crawler".to_string();
        sample.general.log_level = "debug".to_string();

        save_toml(&path, &sample).unwrap();
        let loaded: Sample = load_toml(&path).unwrap();
        assert_eq!(loaded, sample);
    }

    #[test]
    fn test_missing_file_uses_default() {
        let dir = TempDir::new().unwrap();
        let loaded: Sample = load_toml_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[general]\nlog_format = \"json\"\n").unwrap();

        let loaded: Sample = load_toml(&path).unwrap();
        assert_eq!(loaded.general.log_format, LogFormat::Json);
        assert_eq!(loaded.general.log_level, "info");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "general = [").unwrap();

        let err = load_toml::<Sample>(&path).unwrap_err();
        assert!(matches!(err, SiftError::Config(_)));
    }

    #[test]
    fn test_validate_log_level() {
        let mut general = GeneralConfig::default();
        assert!(general.validate().is_ok());
        general.log_level = "loud".to_string();
        assert!(general.validate().is_err());
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = resolve_config_path(Some(Path::new("/tmp/custom.toml")));
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }
}

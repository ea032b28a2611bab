//! Effective configuration for the `sift` binary.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sift_core::config::{load_toml_or_default, resolve_config_path};
use sift_core::GeneralConfig;
use sift_mining::MiningConfig;
use sift_semantic::SemanticConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Whole configuration file: one section per component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    pub general: GeneralConfig,
    pub mining: MiningConfig,
    pub semantic: SemanticConfig,
}

impl SiftConfig {
    /// Load from `explicit`, `$SIFT_CONFIG_PATH` or `~/.sift/config.toml`,
    /// then apply `SIFT_*` overrides and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(explicit);
        if explicit.is_some() && !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }

        let mut config: Self = load_toml_or_default(&path)?;
        debug!("Configuration resolved from {}", path.display());

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.general.apply_env()?;
        self.mining.apply_env()?;
        self.semantic
            .apply_env()
            .context("Invalid semantic environment override")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.general.validate()?;
        self.mining.validate()?;
        self.semantic.validate()?;
        Ok(())
    }

    /// Index file: `semantic.index.persist_path`, else `<data_dir>/index.bin`.
    pub fn index_path(&self) -> PathBuf {
        self.semantic
            .index
            .persist_path
            .clone()
            .unwrap_or_else(|| self.general.data_dir.join("index.bin"))
    }

    /// Default directory for mining results.
    pub fn results_dir(&self) -> PathBuf {
        self.general.data_dir.join("results")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(SiftConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_sections_are_optional() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[mining]\nworkers = 2\n\n[semantic.chunking]\nchunk_size = 40\noverlap = 4\n",
        )
        .unwrap();

        let config: SiftConfig = sift_core::config::load_toml(&path).unwrap();
        assert_eq!(config.mining.workers, 2);
        assert_eq!(config.semantic.chunking.chunk_size, 40);
        assert_eq!(config.general, GeneralConfig::default());
    }

    #[test]
    fn test_index_path_defaults_under_data_dir() {
        let mut config = SiftConfig::default();
        config.general.data_dir = PathBuf::from("/var/lib/sift");
        assert_eq!(config.index_path(), PathBuf::from("/var/lib/sift/index.bin"));

        config.semantic.index.persist_path = Some(PathBuf::from("/tmp/idx.bin"));
        assert_eq!(config.index_path(), PathBuf::from("/tmp/idx.bin"));
    }

    #[test]
    fn test_default_config_renders_as_toml() {
        let rendered = SiftConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[mining]"));
        assert!(rendered.contains("[semantic.chunking]"));
    }
}

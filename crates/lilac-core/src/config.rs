//! Engine tunables, loaded the way the teacher loads `AppConfig` (§11
//! "Configuration"): a `ConfigManager`-style directory/file lookup, a
//! serde-derived struct with field-by-field `Default`, optional TOML
//! override on disk.

use std::path::{Path as FsPath, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LilacError, Result};
use crate::stats::{DEFAULT_DISTINCT_CAP, DEFAULT_SAMPLE_SIZE};

const CONFIG_FILENAME: &str = "config.toml";

/// Locates and loads the on-disk config file, mirroring the teacher's
/// `ConfigManager` (directory resolution + ensure/write helpers) without
/// the theme/display concerns that don't apply to a headless engine.
#[derive(Clone)]
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Custom config directory, primarily for testing.
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    pub fn new(app_name: &str) -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| LilacError::storage("could not determine config directory"))?
            .join(app_name);
        Ok(Self { config_dir })
    }

    pub fn config_dir(&self) -> &FsPath {
        &self.config_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILENAME)
    }

    pub fn ensure_config_dir(&self) -> Result<()> {
        if !self.config_dir.exists() {
            std::fs::create_dir_all(&self.config_dir).map_err(|e| {
                LilacError::storage(format!("creating {}: {e}", self.config_dir.display()))
            })?;
        }
        Ok(())
    }

    pub fn write_default_config(&self, force: bool) -> Result<PathBuf> {
        let path = self.config_path();
        if path.exists() && !force {
            return Err(LilacError::storage(format!(
                "config file already exists at {} (use force to overwrite)",
                path.display()
            )));
        }
        self.ensure_config_dir()?;
        let toml_str = toml::to_string_pretty(&EngineConfig::default())
            .map_err(|e| LilacError::storage(format!("serializing default config: {e}")))?;
        std::fs::write(&path, toml_str)
            .map_err(|e| LilacError::storage(format!("writing {}: {e}", path.display())))?;
        Ok(path)
    }
}

/// Engine-wide tunables (§4.8 approx-distinct sampling, §4.2 recompute
/// polling). Distinct from per-request options like a query's `limit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Row sample size used by `stats()`'s approx-distinct-count and
    /// average-text-length estimators (§4.8).
    pub sample_size: usize,
    /// Maximum distinct group keys `select_groups()` will materialize
    /// before falling back to capped/binned output (§4.8).
    pub distinct_cap: usize,
    /// How often a long-lived `Dataset` re-checks on-disk mtimes to decide
    /// whether its cached merged view is stale (§4.2, §5).
    pub recompute_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            distinct_cap: DEFAULT_DISTINCT_CAP,
            recompute_poll_interval_ms: 200,
        }
    }
}

impl EngineConfig {
    /// Loads `app_name`'s config file if present, falling back to
    /// defaults; does not error when the file is absent (same contract as
    /// the teacher's `AppConfig::load`).
    pub fn load(app_name: &str) -> Result<Self> {
        let manager = ConfigManager::new(app_name)?;
        Self::load_from(&manager.config_path())
    }

    pub fn load_from(path: &FsPath) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| LilacError::storage(format!("reading {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LilacError::storage(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_size == 0 {
            return Err(LilacError::invalid_query("sample_size must be greater than 0"));
        }
        if self.distinct_cap == 0 {
            return Err(LilacError::invalid_query("distinct_cap must be greater than 0"));
        }
        if self.recompute_poll_interval_ms == 0 {
            return Err(LilacError::invalid_query(
                "recompute_poll_interval_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().to_path_buf());
        let path = manager.write_default_config(false).unwrap();
        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, EngineConfig::default());
    }

    #[test]
    fn write_default_config_refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().to_path_buf());
        manager.write_default_config(false).unwrap();
        let err = manager.write_default_config(false).unwrap_err();
        assert!(matches!(err, LilacError::StorageError { .. }));
    }

    #[test]
    fn rejects_zero_sample_size() {
        let mut config = EngineConfig::default();
        config.sample_size = 0;
        assert!(config.validate().is_err());
    }
}

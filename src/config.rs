//! `AppConfig`: a layered TOML configuration with per-plugin overrides and a
//! SHA-256 fingerprint recorded on every `Run` row.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};

/// Per-plugin selection and limit overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub enabled: bool,
    pub timeout_seconds: Option<u64>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: None,
        }
    }
}

/// The engine's full set of recognized options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub max_parallel_tasks: usize,
    pub max_memory_bytes: Option<u64>,
    pub max_parallel_downloads: usize,
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub confidence_alpha: f64,
    pub plugin: HashMap<String, PluginConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 4,
            max_memory_bytes: None,
            max_parallel_downloads: 2,
            continue_on_error: true,
            dry_run: false,
            confidence_alpha: 0.1,
            plugin: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Loads the config file at `path`, falling back to defaults if it does
    /// not exist. A malformed file is a `ConfigError`, aborting before run.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::ConfigError(format!("failed to read {}: {e}", path.display())))?;
        let config: AppConfig =
            toml::from_str(&text).map_err(|e| EngineError::ConfigError(format!("invalid config at {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel_tasks == 0 {
            return Err(EngineError::ConfigError("max_parallel_tasks must be at least 1".to_string()));
        }
        if self.max_parallel_downloads == 0 {
            return Err(EngineError::ConfigError("max_parallel_downloads must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.confidence_alpha) {
            return Err(EngineError::ConfigError("confidence_alpha must be in [0, 1)".to_string()));
        }
        Ok(())
    }

    /// Default config file location, `$XDG_CONFIG_HOME/update-all/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("update-all").join("config.toml"))
    }

    pub fn is_plugin_enabled(&self, name: &str) -> bool {
        self.plugin.get(name).map(|p| p.enabled).unwrap_or(true)
    }

    pub fn plugin_timeout(&self, name: &str) -> Option<std::time::Duration> {
        self.plugin
            .get(name)
            .and_then(|p| p.timeout_seconds)
            .map(std::time::Duration::from_secs)
    }

    /// SHA-256 hex digest of the effective configuration, serialized
    /// deterministically, recorded on `Run.config_fingerprint` so a stored
    /// run can be traced back to the options that produced it.
    ///
    /// `plugin` is a `HashMap` whose iteration order is randomized per
    /// process, so it is serialized via a `BTreeMap` view to keep the
    /// fingerprint stable across runs of an identical config file.
    pub fn fingerprint(&self) -> String {
        let canonical_plugin: BTreeMap<&String, &PluginConfig> = self.plugin.iter().collect();
        let canonical = CanonicalConfig {
            max_parallel_tasks: self.max_parallel_tasks,
            max_memory_bytes: self.max_memory_bytes,
            max_parallel_downloads: self.max_parallel_downloads,
            continue_on_error: self.continue_on_error,
            dry_run: self.dry_run,
            confidence_alpha: self.confidence_alpha,
            plugin: canonical_plugin,
        };
        let canonical = serde_json::to_string(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// `AppConfig` with `plugin` keyed by a `BTreeMap` instead of a `HashMap`,
/// serialized only to compute a deterministic fingerprint.
#[derive(Serialize)]
struct CanonicalConfig<'a> {
    max_parallel_tasks: usize,
    max_memory_bytes: Option<u64>,
    max_parallel_downloads: usize,
    continue_on_error: bool,
    dry_run: bool,
    confidence_alpha: f64,
    plugin: BTreeMap<&'a String, &'a PluginConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_parallel_tasks_is_rejected() {
        let mut config = AppConfig::default();
        config.max_parallel_tasks = 0;
        assert!(matches!(config.validate(), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn fingerprint_is_stable_for_identical_config() {
        let a = AppConfig::default();
        let b = AppConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_is_stable_regardless_of_plugin_insertion_order() {
        let mut a = AppConfig::default();
        a.plugin.insert("apt".into(), PluginConfig::default());
        a.plugin.insert("brew".into(), PluginConfig::default());
        a.plugin.insert("dnf".into(), PluginConfig::default());

        let mut b = AppConfig::default();
        b.plugin.insert("dnf".into(), PluginConfig::default());
        b.plugin.insert("apt".into(), PluginConfig::default());
        b.plugin.insert("brew".into(), PluginConfig::default());

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_options() {
        let a = AppConfig::default();
        let mut b = AppConfig::default();
        b.dry_run = true;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/update-all/config.toml")).unwrap();
        assert_eq!(config.max_parallel_tasks, 4);
    }

    #[test]
    fn plugin_enablement_defaults_to_true_for_unlisted_plugins() {
        let config = AppConfig::default();
        assert!(config.is_plugin_enabled("apt"));
    }
}

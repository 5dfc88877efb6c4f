//! Configuration for the model cache.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the model directory.
pub const MODEL_PATH_ENV: &str = "MODEL_PATH";

/// Configuration for the model cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory holding model weight files (default: `models/`).
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Bytes assumed for a model whose file size cannot be read (default: 2 GiB).
    #[serde(default = "default_fallback_estimate_bytes")]
    pub fallback_estimate_bytes: u64,

    /// Index of the GPU whose memory is managed (default: 0).
    #[serde(default)]
    pub gpu_index: u32,

    /// Seconds between resource monitor reports (default: 1).
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models/")
}

fn default_fallback_estimate_bytes() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_monitor_interval_secs() -> u64 {
    1
}

/// Errors that can occur while loading or validating cache configuration.
#[derive(Debug, Error)]
pub enum CacheConfigError {
    /// The model directory is empty.
    #[error("Invalid model directory: must not be empty")]
    EmptyModelDir,

    /// Invalid fallback estimate (must be > 0).
    #[error("Invalid fallback estimate: must be greater than 0")]
    InvalidFallbackEstimate,

    /// Invalid monitor interval (must be > 0).
    #[error("Invalid monitor interval: must be greater than 0")]
    InvalidMonitorInterval,

    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            fallback_estimate_bytes: default_fallback_estimate_bytes(),
            gpu_index: 0,
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

impl CacheConfig {
    /// Validate the cache configuration.
    ///
    /// # Errors
    /// Returns `CacheConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), CacheConfigError> {
        if self.model_dir.as_os_str().is_empty() {
            return Err(CacheConfigError::EmptyModelDir);
        }

        if self.fallback_estimate_bytes == 0 {
            return Err(CacheConfigError::InvalidFallbackEstimate);
        }

        if self.monitor_interval_secs == 0 {
            return Err(CacheConfigError::InvalidMonitorInterval);
        }

        Ok(())
    }

    /// Sets the model directory.
    #[must_use]
    pub fn with_model_dir(mut self, model_dir: impl Into<PathBuf>) -> Self {
        self.model_dir = model_dir.into();
        self
    }

    /// Applies overrides from a variable lookup (`MODEL_PATH`).
    ///
    /// Blank values are ignored.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(MODEL_PATH_ENV).filter(|v| !v.trim().is_empty()) {
            self.model_dir = PathBuf::from(dir.trim());
        }
        self
    }

    /// Applies overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Get the monitor interval as a Duration.
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Load cache configuration from workspace config file.
///
/// Searches for `.ember/config.toml` in the workspace root.
/// If the file or its `[models.cache]` section is missing, the default configuration is used.
/// A non-blank `MODEL_PATH` environment variable then overrides the model directory.
///
/// # Errors
/// Returns error if config file exists but cannot be read or parsed, or if the resulting
/// configuration is invalid.
pub fn load_cache_config(workspace_root: &Path) -> Result<CacheConfig, CacheConfigError> {
    let config = read_config_file(workspace_root)?.with_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Load cache configuration, taking overrides from `lookup` instead of the process environment.
///
/// # Errors
/// See [`load_cache_config`].
pub fn load_cache_config_with(
    workspace_root: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<CacheConfig, CacheConfigError> {
    let config = read_config_file(workspace_root)?.with_overrides_from(lookup);
    config.validate()?;
    Ok(config)
}

fn read_config_file(workspace_root: &Path) -> Result<CacheConfig, CacheConfigError> {
    let config_path = default_config_path(workspace_root);

    if !config_path.exists() {
        return Ok(CacheConfig::default());
    }

    let content = std::fs::read_to_string(&config_path)?;
    let file: ConfigFile = toml::from_str(&content)?;

    Ok(file
        .models
        .and_then(|models| models.cache)
        .unwrap_or_default())
}

/// Get the default config file path for a workspace.
#[must_use]
pub fn default_config_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".ember").join("config.toml")
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    models: Option<ModelsSection>,
}

#[derive(Debug, Deserialize)]
struct ModelsSection {
    cache: Option<CacheConfig>,
}

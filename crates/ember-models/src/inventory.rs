//! Model file inventory.
//!
//! Model files are declared in a `.env` file as `MODEL_<NAME>=<file>.gguf` variables, next to
//! `MODEL_PATH=<dir>`. This module reads those declarations, reports which files are missing from
//! the model directory, and (with the `download` feature) fetches them from HuggingFace Hub.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::MODEL_PATH_ENV;

/// Default model directory when `MODEL_PATH` is not declared.
pub const DEFAULT_MODEL_DIR: &str = "models/";

static MODEL_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r##"^(MODEL_[\w.]+)\s*=\s*"?([^"#]+)"?"##)
        .expect("valid MODEL_ variable pattern")
});

/// Errors that can occur while checking or fetching model files.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// I/O error on the model directory.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No HuggingFace repository is known for the file.
    #[error("No HuggingFace repo configured for '{0}'")]
    UnknownRepo(String),

    /// Download from HuggingFace Hub failed.
    #[error("Failed to download {filename} from {repo}: {message}")]
    Download {
        /// Repository id.
        repo: String,
        /// File name.
        filename: String,
        /// Underlying error message.
        message: String,
    },
}

/// Reads `MODEL_*` variables whose values are `.gguf` file names.
///
/// `MODEL_PATH`, blank lines and comments are skipped. Returns an empty map if the file does
/// not exist.
#[must_use]
pub fn parse_env_models(env_path: &Path) -> BTreeMap<String, String> {
    match std::fs::read_to_string(env_path) {
        Ok(contents) => parse_env_models_str(&contents),
        Err(_) => {
            warn!(path = %env_path.display(), ".env file not found");
            BTreeMap::new()
        }
    }
}

/// Reads `MODEL_*` declarations from `.env` contents.
#[must_use]
pub fn parse_env_models_str(contents: &str) -> BTreeMap<String, String> {
    env_assignments(contents)
        .filter(|(key, value)| key != MODEL_PATH_ENV && value.ends_with(".gguf"))
        .collect()
}

/// Reads the model directory from `MODEL_PATH`, defaulting to `models/`.
#[must_use]
pub fn model_dir_from_env_file(env_path: &Path) -> PathBuf {
    std::fs::read_to_string(env_path)
        .ok()
        .and_then(|contents| {
            env_assignments(&contents)
                .find(|(key, _)| key == MODEL_PATH_ENV)
                .map(|(_, value)| value)
        })
        .map_or_else(|| PathBuf::from(DEFAULT_MODEL_DIR), PathBuf::from)
}

fn env_assignments(contents: &str) -> impl Iterator<Item = (String, String)> + '_ {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let captures = MODEL_VAR.captures(line)?;
            let key = captures.get(1)?.as_str().to_string();
            let value = captures.get(2)?.as_str().trim().to_string();
            Some((key, value))
        })
}

/// Maps model file names to the HuggingFace repositories that publish them.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    repos: BTreeMap<String, String>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let repos = [
            (
                "qwen2.5-1.5b-instruct-fp16.gguf",
                "Qwen/Qwen2.5-1.5B-Instruct-GGUF",
            ),
            ("Qwen3-14B-Q5_0.gguf", "Qwen/Qwen3-14B-GGUF"),
            (
                "Hermes-2-Pro-Llama-3-8B-Q5_K_M.gguf",
                "NousResearch/Hermes-2-Pro-Llama-3-8B-GGUF",
            ),
            (
                "llama-2-7b-chat.Q3_K_M.gguf",
                "TheBloke/Llama-2-7B-Chat-GGUF",
            ),
            (
                "mistral-7b-instruct-v0.2.Q3_K_L.gguf",
                "TheBloke/Mistral-7B-Instruct-v0.2-GGUF",
            ),
            (
                "Phi-3-mini-4k-instruct-q4.gguf",
                "microsoft/Phi-3-mini-4k-instruct-gguf",
            ),
            (
                "Finance-Llama-8B-GGUF-q4_K_M.gguf",
                "tarun7r/Finance-Llama-8B-q4_k_m-GGUF",
            ),
            ("phi-4-Q5_0.gguf", "microsoft/phi-4-gguf"),
        ];
        Self {
            repos: repos
                .into_iter()
                .map(|(file, repo)| (file.to_string(), repo.to_string()))
                .collect(),
        }
    }
}

impl ModelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            repos: BTreeMap::new(),
        }
    }

    /// Registers (or replaces) the repository for a file.
    pub fn register(&mut self, filename: impl Into<String>, repo_id: impl Into<String>) {
        self.repos.insert(filename.into(), repo_id.into());
    }

    /// Repository publishing `filename`.
    #[must_use]
    pub fn repo_for(&self, filename: &str) -> Option<&str> {
        self.repos.get(filename).map(String::as_str)
    }

    /// Number of registered files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.repos.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

/// Presence of declared model files in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInventory {
    /// Directory that was checked.
    pub model_dir: PathBuf,
    /// Variable name to file name, for files found.
    pub present: BTreeMap<String, String>,
    /// Variable name to file name, for files not found.
    pub missing: BTreeMap<String, String>,
}

impl ModelInventory {
    /// Checks which of `models` exist in `model_dir`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns `InventoryError::Io` if the directory cannot be created.
    pub fn check(
        model_dir: &Path,
        models: &BTreeMap<String, String>,
    ) -> Result<Self, InventoryError> {
        if !model_dir.exists() {
            info!(path = %model_dir.display(), "Creating models directory");
            std::fs::create_dir_all(model_dir).map_err(|source| InventoryError::Io {
                path: model_dir.to_path_buf(),
                source,
            })?;
        }

        let (present, missing): (BTreeMap<_, _>, BTreeMap<_, _>) = models
            .iter()
            .map(|(var, file)| (var.clone(), file.clone()))
            .partition(|(_, file)| model_dir.join(file).is_file());

        if !present.is_empty() {
            info!(
                present = present.len(),
                total = models.len(),
                "Models already downloaded"
            );
            for (var, file) in &present {
                debug!(var = %var, file = %file, "Model present");
            }
        }
        if missing.is_empty() {
            info!("All models are present");
        } else {
            info!(
                missing = missing.len(),
                total = models.len(),
                "Missing models"
            );
            for (var, file) in &missing {
                info!(var = %var, file = %file, "Model missing");
            }
        }

        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            present,
            missing,
        })
    }

    /// Whether every declared file is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Downloads every missing file that has a known repository.
    ///
    /// Per-file failures are logged and skipped. Returns the paths of the files fetched.
    #[cfg(feature = "download")]
    pub fn download_missing(&mut self, registry: &ModelRegistry) -> Vec<PathBuf> {
        let mut fetched = Vec::new();
        let missing = std::mem::take(&mut self.missing);

        for (var, file) in missing {
            match download_model(registry, &file, &self.model_dir) {
                Ok(path) => {
                    info!(file = %file, "Successfully downloaded");
                    fetched.push(path);
                    self.present.insert(var, file);
                }
                Err(e) => {
                    warn!(var = %var, file = %file, error = %e, "Skipping model");
                    self.missing.insert(var, file);
                }
            }
        }
        fetched
    }
}

/// Fetches `filename` from its registered repository into `model_dir`.
///
/// # Errors
/// Returns `InventoryError::UnknownRepo` if no repository is registered for the file,
/// `InventoryError::Download` if the transfer fails, or `InventoryError::Io` if the file cannot
/// be copied into place.
#[cfg(feature = "download")]
pub fn download_model(
    registry: &ModelRegistry,
    filename: &str,
    model_dir: &Path,
) -> Result<PathBuf, InventoryError> {
    use hf_hub::api::sync::Api;

    let repo_id = registry
        .repo_for(filename)
        .ok_or_else(|| InventoryError::UnknownRepo(filename.to_string()))?;
    info!(file = %filename, repo = %repo_id, "Downloading model");

    let download_error = |message: String| InventoryError::Download {
        repo: repo_id.to_string(),
        filename: filename.to_string(),
        message,
    };

    let api = Api::new().map_err(|e| download_error(e.to_string()))?;
    let cached = api
        .model(repo_id.to_string())
        .get(filename)
        .map_err(|e| download_error(e.to_string()))?;

    let target = model_dir.join(filename);
    std::fs::copy(&cached, &target).map_err(|source| InventoryError::Io {
        path: target.clone(),
        source,
    })?;
    Ok(target)
}

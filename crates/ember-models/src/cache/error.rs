//! Errors returned by the model cache.

use ember_abstraction::{ModelError, ModelKind};
use thiserror::Error;

use crate::gpu::GpuQueryError;

/// Errors that can occur while obtaining a model handle.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested model file does not exist or the model directory cannot be resolved.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The native engine failed to construct the model.
    #[error("Failed to load {kind} model '{model}': {source}")]
    ResourceLoad {
        /// The weights file name.
        model: String,
        /// The requested kind.
        kind: ModelKind,
        /// The native error.
        #[source]
        source: ModelError,
    },

    /// GPU memory could not be queried, so no eviction decision can be verified.
    #[error("GPU memory query failed: {0}")]
    ResourceQuery(#[from] GpuQueryError),
}

impl CacheError {
    /// Whether the error was caused by a missing model file or directory.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Whether the error was raised by the native engine.
    #[must_use]
    pub const fn is_resource_load(&self) -> bool {
        matches!(self, Self::ResourceLoad { .. })
    }
}

//! GPU-memory-aware model cache.
//!
//! Loaded models are kept resident and shared across callers. When a new model does not fit in
//! free GPU memory, least-recently-used models are unloaded until it does.

pub mod cache;
pub mod config;
pub mod error;
pub mod types;

pub use cache::ModelResourceCache;
pub use config::{
    CacheConfig, CacheConfigError, MODEL_PATH_ENV, default_config_path, load_cache_config,
    load_cache_config_with,
};
pub use error::CacheError;
pub use types::{CacheKey, CacheStats, EntryId, EntrySnapshot};

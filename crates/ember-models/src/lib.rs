//! Local model management for Ember.
//!
//! This crate keeps GGUF models resident on the GPU and shares them across callers.
//!
//! # Components
//!
//! - **cache**: [`ModelResourceCache`], the GPU-memory-aware LRU cache of loaded models
//! - **handle**: cheap, cloneable handles to cached models
//! - **gpu**: GPU memory probes (`NvmlProbe` with the `nvml` feature)
//! - **llama**: llama.cpp binding (`llama` feature)
//! - **structured**: JSON-typed generation on completion handles
//! - **monitor**: periodic VRAM/RAM reporting
//! - **inventory**: `.env` model declarations and HuggingFace downloads
//! - **mock**: simulated GPU and loader for tests and demos

pub mod cache;
pub mod gpu;
pub mod handle;
pub mod inventory;
#[cfg(feature = "llama")]
pub mod llama;
pub mod logging;
pub mod mock;
pub mod monitor;
pub mod silence;
pub mod structured;

pub use cache::{
    CacheConfig, CacheConfigError, CacheError, CacheKey, CacheStats, EntryId, EntrySnapshot,
    ModelResourceCache, load_cache_config, load_cache_config_with,
};
#[cfg(feature = "nvml")]
pub use gpu::NvmlProbe;
pub use gpu::{GpuMemoryInfo, GpuMemoryProbe, GpuQueryError, UnboundedProbe};
pub use handle::{CompletionHandle, ConversationalHandle, ModelHandle};
pub use inventory::{InventoryError, ModelInventory, ModelRegistry};
#[cfg(feature = "llama")]
pub use llama::{LlamaLoader, LlamaNativeModel};
pub use mock::{MockLoader, MockModel, SimulatedGpu};
pub use monitor::{MonitorError, ResourceMonitor, ResourceSample};
pub use silence::StdioSilencer;
pub use structured::{StructuredOutputError, generate_structured};

pub use ember_abstraction::{
    ChatMessage, LoadConfig, ModelError, ModelKind, ModelLoader, ModelResponse, ModelUsage,
    NativeModel,
};

//! Model abstraction layer for Ember.
//!
//! This module defines the core traits and types shared by the model cache and the native
//! inference bindings that plug into it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Represents an error that can occur when loading or invoking a local model.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    /// The native engine failed to construct a model context (corrupt weights, unsupported
    /// quantization, GPU allocation failure).
    #[error("Load Error: {0}")]
    LoadError(String),

    /// The native engine failed while generating (tokenization, decode, sampling).
    #[error("Generation Error: {0}")]
    GenerationError(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    SerializationError(String),

    /// The handle kind does not support the requested operation.
    #[error("Unsupported Operation: {0}")]
    UnsupportedOperation(String),

    /// The cache entry backing this handle was evicted and its native context released.
    #[error("Model '{model}' ({kind}) was evicted from the cache")]
    Evicted {
        /// The model file name.
        model: String,
        /// The handle kind.
        kind: ModelKind,
    },

    /// Other unexpected errors.
    #[error("Other Model Error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// The capability class of a loaded model.
///
/// The same weights file loaded under two kinds occupies two independent cache slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Multi-turn chat-style invocation.
    Conversational,
    /// Single-shot constrained/structured generation.
    Completion,
}

impl ModelKind {
    /// Returns the canonical lowercase name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conversational => "conversational",
            Self::Completion => "completion",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conversational" | "chat" => Ok(Self::Conversational),
            "completion" | "raw" => Ok(Self::Completion),
            _ => Err(()),
        }
    }
}

/// Represents a message in a conversation with a chat model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender (e.g., "user", "assistant", "system").
    pub role: String,
    /// The content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message with an arbitrary role.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Creates a `system` message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Creates a `user` message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Creates an `assistant` message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// The response from a text generation or chat completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The generated content.
    pub content: String,

    /// Optional: The ID of the model used to generate the response.
    pub model_id: Option<String>,

    /// Optional: Usage statistics for the request.
    pub usage: Option<ModelUsage>,
}

/// Usage statistics for a model request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    /// Number of tokens in the prompt.
    pub prompt_tokens: u32,

    /// Number of tokens in the completion.
    pub completion_tokens: u32,

    /// Total number of tokens used.
    pub total_tokens: u32,
}

impl ModelUsage {
    /// Builds usage statistics from prompt and completion token counts.
    #[must_use]
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Seed used by the sampler chain when none is configured.
pub const DEFAULT_SEED: u32 = 1234;

/// Parameters applied when a model is constructed.
///
/// Sampling knobs are fixed at load time; a cached handle keeps the configuration it was
/// loaded with until it is evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Token context window size.
    pub n_ctx: u32,

    /// Number of transformer layers offloaded to the GPU (`-1` = all).
    pub n_gpu_layers: i32,

    /// Prompt processing batch size.
    pub n_batch: u32,

    /// CPU worker threads for non-offloaded computation.
    /// `None` resolves to the number of CPU cores minus one.
    pub n_threads: Option<u32>,

    /// Maximum number of tokens to generate per call.
    pub max_tokens: u32,

    /// Sampling temperature.
    pub temperature: f32,

    /// Nucleus sampling probability mass.
    pub top_p: f32,

    /// Top-k sampling cutoff.
    pub top_k: i32,

    /// Penalty applied to recently generated tokens.
    pub repeat_penalty: f32,

    /// Sampler seed.
    pub seed: u32,

    /// When `false`, native initialization output is suppressed.
    pub verbose: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_gpu_layers: 0,
            n_batch: 512,
            n_threads: None,
            max_tokens: 2500,
            temperature: 0.8,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            seed: DEFAULT_SEED,
            verbose: false,
        }
    }
}

impl LoadConfig {
    /// Default profile for conversational handles.
    #[must_use]
    pub fn conversational() -> Self {
        Self {
            n_ctx: 8192,
            n_gpu_layers: -1,
            n_batch: 1000,
            max_tokens: 512,
            temperature: 0.5,
            repeat_penalty: 1.5,
            ..Self::default()
        }
    }

    /// Default profile for completion handles.
    #[must_use]
    pub fn completion() -> Self {
        Self::default()
    }

    /// Default profile for the given kind.
    #[must_use]
    pub fn for_kind(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Conversational => Self::conversational(),
            ModelKind::Completion => Self::completion(),
        }
    }

    /// Sets the context window size.
    #[must_use]
    pub fn with_n_ctx(mut self, n_ctx: u32) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    /// Sets the number of GPU-offloaded layers (`-1` = all).
    #[must_use]
    pub fn with_n_gpu_layers(mut self, n_gpu_layers: i32) -> Self {
        self.n_gpu_layers = n_gpu_layers;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_n_batch(mut self, n_batch: u32) -> Self {
        self.n_batch = n_batch;
        self
    }

    /// Sets an explicit CPU thread count.
    #[must_use]
    pub fn with_n_threads(mut self, n_threads: u32) -> Self {
        self.n_threads = Some(n_threads);
        self
    }

    /// Sets the maximum number of generated tokens.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets nucleus sampling.
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Sets the top-k cutoff.
    #[must_use]
    pub fn with_top_k(mut self, top_k: i32) -> Self {
        self.top_k = top_k;
        self
    }

    /// Sets the repeat penalty.
    #[must_use]
    pub fn with_repeat_penalty(mut self, repeat_penalty: f32) -> Self {
        self.repeat_penalty = repeat_penalty;
        self
    }

    /// Sets the sampler seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Enables or disables native initialization output.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Effective CPU thread count: the configured value, or cores minus one (at least one).
    #[must_use]
    pub fn resolved_threads(&self) -> u32 {
        self.n_threads.unwrap_or_else(|| {
            let cores = u32::try_from(num_cpus::get()).unwrap_or(u32::MAX);
            cores.saturating_sub(1).max(1)
        })
    }

    /// Whether every layer should be offloaded to the GPU.
    #[must_use]
    pub const fn offloads_all_layers(&self) -> bool {
        self.n_gpu_layers < 0
    }
}

/// A loaded native model context.
///
/// Implementations own the engine resources (mapped weights, GPU buffers, worker threads) and
/// must release them when dropped. The cache relies on this to observe freed GPU memory right
/// after an eviction.
pub trait NativeModel: Send + Sync {
    /// Generates a completion for a single prompt.
    ///
    /// # Errors
    /// Returns a `ModelError` if generation fails.
    fn generate_text(&self, prompt: &str) -> Result<ModelResponse, ModelError>;

    /// Generates a reply given a message history.
    ///
    /// Only conversational contexts support this; the default rejects the call.
    ///
    /// # Errors
    /// Returns a `ModelError` if generation fails or the context is not conversational.
    fn generate_chat_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ModelResponse, ModelError> {
        let _ = messages;
        Err(ModelError::UnsupportedOperation(format!(
            "{} does not support chat completion",
            self.model_id()
        )))
    }

    /// Returns the ID of the model (its file name).
    fn model_id(&self) -> &str;
}

/// Constructs native model contexts, selecting the binding appropriate for the requested kind.
pub trait ModelLoader: Send + Sync {
    /// Loads the weights file at `path`.
    ///
    /// # Errors
    /// Returns `ModelError::LoadError` if the native engine cannot construct the model.
    fn load(
        &self,
        kind: ModelKind,
        path: &Path,
        config: &LoadConfig,
    ) -> Result<Box<dyn NativeModel>, ModelError>;
}

//! llama.cpp binding for GGUF models.
//!
//! The loaded [`LlamaModel`] holds the weights (and their GPU buffers when layers are offloaded).
//! Each generation creates its own context with the configured window, decodes the prompt in
//! `n_batch` chunks, then samples until an end-of-generation token or `max_tokens`.

use ember_abstraction::{
    ChatMessage, LoadConfig, ModelError, ModelKind, ModelLoader, ModelResponse, ModelUsage,
    NativeModel,
};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Tokens considered by the repeat penalty.
const PENALTY_LAST_N: i32 = 64;

static BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn backend() -> Result<&'static LlamaBackend, ModelError> {
    BACKEND
        .get_or_init(|| LlamaBackend::init().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| ModelError::LoadError(format!("Failed to initialize llama backend: {e}")))
}

/// `ModelLoader` backed by llama.cpp.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlamaLoader;

impl LlamaLoader {
    /// Creates the loader.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ModelLoader for LlamaLoader {
    fn load(
        &self,
        kind: ModelKind,
        path: &Path,
        config: &LoadConfig,
    ) -> Result<Box<dyn NativeModel>, ModelError> {
        let backend = backend()?;

        let gpu_layers = if config.offloads_all_layers() {
            i32::MAX.unsigned_abs()
        } else {
            config.n_gpu_layers.unsigned_abs()
        };
        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

        let model = LlamaModel::load_from_file(backend, path, &model_params)
            .map_err(|e| ModelError::LoadError(format!("{}: {e}", path.display())))?;

        let id = path.file_name().map_or_else(
            || path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        );
        info!(model = %id, kind = %kind, gpu_layers, "llama.cpp model loaded");

        Ok(Box::new(LlamaNativeModel {
            id,
            kind,
            model,
            config: config.clone(),
        }))
    }
}

/// A GGUF model loaded through llama.cpp.
pub struct LlamaNativeModel {
    id: String,
    kind: ModelKind,
    model: LlamaModel,
    config: LoadConfig,
}

impl LlamaNativeModel {
    fn generate(&self, prompt: &str) -> Result<ModelResponse, ModelError> {
        let backend = backend()?;
        let config = &self.config;
        let n_batch = config.n_batch.max(1);
        let threads = i32::try_from(config.resolved_threads()).unwrap_or(i32::MAX);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(config.n_ctx))
            .with_n_batch(n_batch)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);
        let mut ctx = self
            .model
            .new_context(backend, ctx_params)
            .map_err(|e| generation_error("Failed to create context", e))?;

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| generation_error("Tokenization failed", e))?;
        if tokens.is_empty() {
            return Err(ModelError::GenerationError("prompt produced no tokens".to_string()));
        }
        let n_ctx = usize::try_from(config.n_ctx).unwrap_or(usize::MAX);
        if tokens.len() >= n_ctx {
            return Err(ModelError::GenerationError(format!(
                "prompt of {} tokens does not fit a context of {n_ctx}",
                tokens.len()
            )));
        }

        let batch_size = usize::try_from(n_batch).unwrap_or(usize::MAX).max(1);
        let mut batch = LlamaBatch::new(batch_size, 1);
        let mut position = 0i32;
        let last_index = tokens.len() - 1;
        for chunk in tokens.chunks(batch_size) {
            batch.clear();
            for &token in chunk {
                let is_last = usize::try_from(position).is_ok_and(|p| p == last_index);
                batch
                    .add(token, position, &[0], is_last)
                    .map_err(|e| generation_error("Failed to add token to batch", e))?;
                position += 1;
            }
            ctx.decode(&mut batch)
                .map_err(|e| generation_error("Decode failed", e))?;
        }

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::penalties(PENALTY_LAST_N, config.repeat_penalty, 0.0, 0.0),
            LlamaSampler::top_k(config.top_k),
            LlamaSampler::top_p(config.top_p, 1),
            LlamaSampler::temp(config.temperature),
            LlamaSampler::dist(config.seed),
        ]);

        let mut generated: Vec<LlamaToken> = Vec::new();
        let max_position = i32::try_from(config.n_ctx).unwrap_or(i32::MAX);
        for _ in 0..config.max_tokens {
            if position >= max_position {
                warn!(model = %self.id, n_ctx = config.n_ctx, "Context window exhausted");
                break;
            }

            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            if self.model.is_eog_token(token) {
                break;
            }
            generated.push(token);

            batch.clear();
            batch
                .add(token, position, &[0], true)
                .map_err(|e| generation_error("Failed to add token", e))?;
            ctx.decode(&mut batch)
                .map_err(|e| generation_error("Decode failed", e))?;
            position += 1;
        }

        let content = self
            .model
            .tokens_to_str(&generated, Special::Tokenize)
            .map_err(|e| generation_error("Token decoding failed", e))?;

        debug!(
            model = %self.id,
            prompt_tokens = tokens.len(),
            generated_tokens = generated.len(),
            "Generation complete"
        );

        Ok(ModelResponse {
            content,
            model_id: Some(self.id.clone()),
            usage: Some(ModelUsage::new(
                token_count(tokens.len()),
                token_count(generated.len()),
            )),
        })
    }

    /// Renders messages through the model's embedded chat template.
    ///
    /// Models without a template get a plain `role: content` transcript.
    fn render_chat(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let template = match self.model.chat_template(None) {
            Ok(template) => template,
            Err(e) => {
                debug!(model = %self.id, error = %e, "No chat template, using plain transcript");
                return Ok(plain_transcript(messages));
            }
        };

        let chat = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.clone(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| generation_error("Invalid chat message", e))?;

        self.model
            .apply_chat_template(&template, &chat, true)
            .map_err(|e| generation_error("Failed to apply chat template", e))
    }
}

impl NativeModel for LlamaNativeModel {
    fn generate_text(&self, prompt: &str) -> Result<ModelResponse, ModelError> {
        self.generate(prompt)
    }

    fn generate_chat_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ModelResponse, ModelError> {
        if self.kind != ModelKind::Conversational {
            return Err(ModelError::UnsupportedOperation(format!(
                "{} was loaded as a {} model",
                self.id, self.kind
            )));
        }
        let prompt = self.render_chat(messages)?;
        self.generate(&prompt)
    }

    fn model_id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for LlamaNativeModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaNativeModel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn generation_error(context: &str, err: impl std::fmt::Display) -> ModelError {
    ModelError::GenerationError(format!("{context}: {err}"))
}

fn token_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn plain_transcript(messages: &[ChatMessage]) -> String {
    let mut transcript: String = messages
        .iter()
        .map(|m| format!("{}: {}\n", m.role, m.content))
        .collect();
    transcript.push_str("assistant:");
    transcript
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_transcript() {
        let messages = [ChatMessage::system("Be brief."), ChatMessage::user("Hi")];
        assert_eq!(
            plain_transcript(&messages),
            "system: Be brief.\nuser: Hi\nassistant:"
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = LlamaLoader::new().load(
            ModelKind::Completion,
            Path::new("/nonexistent/model.gguf"),
            &LoadConfig::default(),
        );
        assert!(matches!(result, Err(ModelError::LoadError(_))));
    }
}

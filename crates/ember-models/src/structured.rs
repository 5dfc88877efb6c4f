//! Typed generation on top of completion handles.
//!
//! The model is asked for JSON and the first JSON object or array in its output is decoded into
//! the caller's type. Output that cannot be decoded is returned to the caller as an error along
//! with the raw text, never silently dropped.

use ember_abstraction::{LoadConfig, ModelError};
use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error};

use crate::cache::{CacheError, ModelResourceCache};
use crate::handle::CompletionHandle;

/// Errors that can occur during structured generation.
#[derive(Debug, Error)]
pub enum StructuredOutputError {
    /// The completion handle could not be obtained.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The native engine failed while generating.
    #[error("Generation failed: {0}")]
    Generation(#[from] ModelError),

    /// The output did not contain JSON matching the requested type.
    #[error("Model output is not a valid {target}: {message}")]
    InvalidOutput {
        /// Name of the requested type.
        target: &'static str,
        /// Decoder error.
        message: String,
        /// Raw model output.
        raw: String,
    },
}

impl StructuredOutputError {
    /// The raw model output, if the failure happened while decoding it.
    #[must_use]
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Self::InvalidOutput { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// Builds the single-shot prompt sent to the model.
#[must_use]
pub fn format_prompt(system_prompt: &str, user_prompt: &str) -> String {
    format!("System prompt: {system_prompt}\nUsers query: {user_prompt}\n")
}

/// Returns the first balanced JSON object or array in `text`.
///
/// Brackets inside string literals are ignored. Returns `None` if no opening bracket is found or
/// the value is never closed.
#[must_use]
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decodes model output into `T`.
///
/// # Errors
/// Returns `StructuredOutputError::InvalidOutput` if the text holds no JSON value or the value
/// does not match `T`.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, StructuredOutputError> {
    let invalid = |message: String| StructuredOutputError::InvalidOutput {
        target: std::any::type_name::<T>(),
        message,
        raw: raw.to_string(),
    };

    let json = extract_json(raw).ok_or_else(|| invalid("no JSON value in output".to_string()))?;
    serde_json::from_str(json).map_err(|e| invalid(e.to_string()))
}

impl CompletionHandle {
    /// Generates a value of type `T` from a system prompt and a user query.
    ///
    /// # Errors
    /// Returns `StructuredOutputError::Generation` if the model fails, or
    /// `StructuredOutputError::InvalidOutput` if its output cannot be decoded into `T`.
    pub fn generate_structured<T: DeserializeOwned>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<T, StructuredOutputError> {
        let prompt = format_prompt(system_prompt, user_prompt);
        debug!(
            model = %self.model_name(),
            prompt = %prompt.chars().take(100).collect::<String>(),
            "Generating structured output"
        );

        let response = self.complete(&prompt)?;
        debug!(model = %self.model_name(), output = %response.content, "Generated output");

        parse_structured(&response.content).inspect_err(|e| {
            error!(model = %self.model_name(), error = %e, "Failed to generate structured output");
        })
    }
}

/// Obtains a completion handle through the cache and generates a value of type `T`.
///
/// # Errors
/// Returns `StructuredOutputError::Cache` if the model cannot be loaded, otherwise see
/// [`CompletionHandle::generate_structured`].
pub fn generate_structured<T: DeserializeOwned>(
    cache: &ModelResourceCache,
    model_name: &str,
    system_prompt: &str,
    user_prompt: &str,
    model_dir: Option<&Path>,
    config: &LoadConfig,
) -> Result<T, StructuredOutputError> {
    let handle = cache.get_or_load_completion(model_name, model_dir, config)?;
    handle.generate_structured(system_prompt, user_prompt)
}

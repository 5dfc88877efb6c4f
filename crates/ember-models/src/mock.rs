//! In-process stand-ins for a GPU and a native engine.
//!
//! [`SimulatedGpu`] keeps a byte counter that [`MockLoader`] charges when it "loads" a model and
//! that [`MockModel`] refunds when it is dropped, so eviction and VRAM accounting can be
//! exercised deterministically without hardware.

use ember_abstraction::{
    ChatMessage, LoadConfig, ModelError, ModelKind, ModelLoader, ModelResponse, ModelUsage,
    NativeModel,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::cache::CacheKey;
use crate::gpu::{GpuMemoryInfo, GpuMemoryProbe, GpuQueryError};

const MIB: u64 = 1024 * 1024;

/// A fake device with a fixed amount of memory.
#[derive(Debug)]
pub struct SimulatedGpu {
    total: u64,
    used: Mutex<u64>,
    failing: AtomicBool,
    queries: AtomicU64,
}

impl SimulatedGpu {
    /// Creates a device with `total` bytes of memory.
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            total,
            used: Mutex::new(0),
            failing: AtomicBool::new(false),
            queries: AtomicU64::new(0),
        }
    }

    /// Creates a device with `total_mib` MiB of memory.
    #[must_use]
    pub fn with_mib(total_mib: u64) -> Self {
        Self::new(total_mib * MIB)
    }

    /// Charges `bytes` against the device. Returns `false` if they do not fit.
    pub fn try_allocate(&self, bytes: u64) -> bool {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        if self.total - *used < bytes {
            return false;
        }
        *used += bytes;
        true
    }

    /// Refunds `bytes` to the device.
    pub fn release(&self, bytes: u64) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        *used = used.saturating_sub(bytes);
    }

    /// Bytes currently charged.
    pub fn used(&self) -> u64 {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent query fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful memory queries so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }
}

impl GpuMemoryProbe for SimulatedGpu {
    fn memory_info(&self) -> Result<GpuMemoryInfo, GpuQueryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GpuQueryError::QueryFailed("simulated device lost".to_string()));
        }
        self.queries.fetch_add(1, Ordering::SeqCst);
        let used = self.used();
        Ok(GpuMemoryInfo {
            total: self.total,
            used,
            free: self.total - used,
        })
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// Memory charged to a [`SimulatedGpu`] for the lifetime of a model.
#[derive(Debug)]
struct GpuAllocation {
    gpu: Arc<SimulatedGpu>,
    bytes: u64,
}

impl Drop for GpuAllocation {
    fn drop(&mut self) {
        self.gpu.release(self.bytes);
    }
}

/// A mock implementation of `NativeModel` for testing and demonstration.
#[derive(Debug)]
pub struct MockModel {
    id: String,
    kind: ModelKind,
    response: Option<String>,
    _allocation: Option<GpuAllocation>,
}

impl MockModel {
    /// Creates a model that holds no device memory.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ModelKind) -> Self {
        Self {
            id: id.into(),
            kind,
            response: None,
            _allocation: None,
        }
    }

    /// Makes every generation return `response` verbatim.
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    fn respond(&self, default: String, prompt_tokens: u32) -> ModelResponse {
        let content = self.response.clone().unwrap_or(default);
        let completion_tokens = count_tokens(&content);
        ModelResponse {
            content,
            model_id: Some(self.id.clone()),
            usage: Some(ModelUsage::new(prompt_tokens, completion_tokens)),
        }
    }
}

impl NativeModel for MockModel {
    fn generate_text(&self, prompt: &str) -> Result<ModelResponse, ModelError> {
        debug!(model_id = %self.id, prompt = %prompt, "MockModel generating text");
        let default = format!("Mock response for: {prompt}\nModel ID: {}", self.id);
        Ok(self.respond(default, count_tokens(prompt)))
    }

    fn generate_chat_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ModelResponse, ModelError> {
        use std::fmt::Write;

        if self.kind != ModelKind::Conversational {
            return Err(ModelError::UnsupportedOperation(format!(
                "{} was loaded as a {} model",
                self.id, self.kind
            )));
        }

        debug!(
            model_id = %self.id,
            message_count = messages.len(),
            "MockModel generating chat completion"
        );

        let mut conversation_summary = String::from("Conversation Summary:\n");
        for message in messages {
            let _ = writeln!(
                conversation_summary,
                "  {}: {}",
                message.role, message.content
            );
        }
        let default = format!(
            "Mock chat response from {}\n{conversation_summary}",
            self.id
        );
        let prompt_tokens = messages
            .iter()
            .map(|m| count_tokens(&m.content))
            .sum::<u32>();
        Ok(self.respond(default, prompt_tokens))
    }

    fn model_id(&self) -> &str {
        &self.id
    }
}

/// A `ModelLoader` that charges each model's file size (plus a fixed overhead) to a
/// [`SimulatedGpu`].
#[derive(Debug)]
pub struct MockLoader {
    gpu: Arc<SimulatedGpu>,
    overhead_bytes: AtomicU64,
    failing: Mutex<HashSet<String>>,
    footprints: Mutex<HashMap<String, u64>>,
    responses: Mutex<HashMap<String, String>>,
    loads: Mutex<Vec<CacheKey>>,
}

impl MockLoader {
    /// Creates a loader charging `gpu`.
    #[must_use]
    pub fn new(gpu: Arc<SimulatedGpu>) -> Self {
        Self {
            gpu,
            overhead_bytes: AtomicU64::new(0),
            failing: Mutex::new(HashSet::new()),
            footprints: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            loads: Mutex::new(Vec::new()),
        }
    }

    /// Adds a fixed per-load overhead (context buffers, scratch space).
    pub fn set_overhead(&self, bytes: u64) {
        self.overhead_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Makes loads of `model_name` fail as if the file were corrupt.
    pub fn fail_model(&self, model_name: &str) {
        lock(&self.failing).insert(model_name.to_string());
    }

    /// Charges `bytes` for `model_name` instead of its file size.
    pub fn set_footprint(&self, model_name: &str, bytes: u64) {
        lock(&self.footprints).insert(model_name.to_string(), bytes);
    }

    /// Makes models loaded from `model_name` answer every call with `response`.
    pub fn set_response(&self, model_name: &str, response: &str) {
        lock(&self.responses)
            .insert(model_name.to_string(), response.to_string());
    }

    /// Number of native loads performed for the key.
    pub fn load_count(&self, kind: ModelKind, model_name: &str) -> usize {
        let key = CacheKey::new(kind, model_name);
        lock(&self.loads).iter().filter(|k| **k == key).count()
    }

    /// Number of native loads performed in total.
    pub fn total_loads(&self) -> usize {
        lock(&self.loads).len()
    }
}

impl ModelLoader for MockLoader {
    fn load(
        &self,
        kind: ModelKind,
        path: &Path,
        config: &LoadConfig,
    ) -> Result<Box<dyn NativeModel>, ModelError> {
        let model_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| ModelError::LoadError(format!("{} has no file name", path.display())))?;

        // Engines announce themselves on the raw streams while loading
        eprintln!(
            "mock engine: loading {} as {} (n_ctx={})",
            path.display(),
            kind,
            config.n_ctx
        );

        lock(&self.loads).push(CacheKey::new(kind, model_name.clone()));

        if lock(&self.failing).contains(&model_name) {
            return Err(ModelError::LoadError(format!(
                "{model_name}: unsupported tensor type in weights file"
            )));
        }

        let footprint = match lock(&self.footprints).get(&model_name) {
            Some(bytes) => *bytes,
            None => std::fs::metadata(path)
                .map_err(|e| ModelError::LoadError(format!("{}: {e}", path.display())))?
                .len(),
        } + self.overhead_bytes.load(Ordering::SeqCst);

        if !self.gpu.try_allocate(footprint) {
            return Err(ModelError::LoadError(format!(
                "{model_name}: out of GPU memory allocating {footprint} bytes"
            )));
        }

        let response = lock(&self.responses).get(&model_name).cloned();
        Ok(Box::new(MockModel {
            id: model_name,
            kind,
            response,
            _allocation: Some(GpuAllocation {
                gpu: Arc::clone(&self.gpu),
                bytes: footprint,
            }),
        }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Count tokens in a string (simplified: word count).
fn count_tokens(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

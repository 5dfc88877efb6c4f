//! Caller-facing model handles.
//!
//! A handle is a cheap, cloneable reference to a cache slot. The native context behind it is
//! owned by the cache entry, not by the handle: when the entry is evicted the context is
//! released at once, and any later call through an outstanding handle fails with
//! [`ModelError::Evicted`]. Eviction waits for a generation already running on that slot.

use ember_abstraction::{ChatMessage, ModelError, ModelKind, ModelResponse, NativeModel};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::cache::{CacheKey, EntryId};

/// Storage shared between a cache entry and the handles it has handed out.
pub(crate) struct HandleSlot {
    entry_id: EntryId,
    key: CacheKey,
    native: RwLock<Option<Box<dyn NativeModel>>>,
}

impl HandleSlot {
    pub(crate) fn new(entry_id: EntryId, key: CacheKey, native: Box<dyn NativeModel>) -> Self {
        Self {
            entry_id,
            key,
            native: RwLock::new(Some(native)),
        }
    }

    pub(crate) fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.native
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drops the native context. Returns `true` if a context was still loaded.
    pub(crate) fn release(&self) -> bool {
        let released = self
            .native
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let was_loaded = released.is_some();
        drop(released);
        if was_loaded {
            debug!(entry = %self.entry_id, key = %self.key, "Released native model context");
        }
        was_loaded
    }

    fn with_native<R>(
        &self,
        f: impl FnOnce(&dyn NativeModel) -> Result<R, ModelError>,
    ) -> Result<R, ModelError> {
        let guard = self.native.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_deref() {
            Some(native) => f(native),
            None => Err(ModelError::Evicted {
                model: self.key.model_name.clone(),
                kind: self.key.kind,
            }),
        }
    }
}

/// Handle to a cached model of either kind.
#[derive(Clone)]
pub struct ModelHandle {
    slot: Arc<HandleSlot>,
}

impl ModelHandle {
    pub(crate) fn new(slot: Arc<HandleSlot>) -> Self {
        Self { slot }
    }

    /// Id of the cache entry this handle points at.
    #[must_use]
    pub fn entry_id(&self) -> EntryId {
        self.slot.entry_id()
    }

    /// Cache key of the entry.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        self.slot.key()
    }

    /// Weights file name.
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.slot.key().model_name
    }

    /// Handle kind.
    #[must_use]
    pub fn kind(&self) -> ModelKind {
        self.slot.key().kind
    }

    /// Whether the native context is still loaded (the entry has not been evicted).
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.slot.is_loaded()
    }

    /// Whether two handles point at the same cache entry.
    #[must_use]
    pub fn same_entry(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Generates a completion for a single prompt.
    ///
    /// # Errors
    /// Returns `ModelError::Evicted` if the entry has been evicted, or the native error if
    /// generation fails.
    pub fn generate_text(&self, prompt: &str) -> Result<ModelResponse, ModelError> {
        self.slot
            .with_native(|native| native.generate_text(prompt))
    }

    /// Narrows this handle to a conversational handle.
    ///
    /// # Errors
    /// Returns `ModelError::UnsupportedOperation` if the handle is a completion handle.
    pub fn into_conversational(self) -> Result<ConversationalHandle, ModelError> {
        ConversationalHandle::try_from(self)
    }

    /// Narrows this handle to a completion handle.
    ///
    /// # Errors
    /// Returns `ModelError::UnsupportedOperation` if the handle is a conversational handle.
    pub fn into_completion(self) -> Result<CompletionHandle, ModelError> {
        CompletionHandle::try_from(self)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("entry_id", &self.entry_id())
            .field("key", self.key())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Handle supporting multi-turn chat.
#[derive(Debug, Clone)]
pub struct ConversationalHandle(ModelHandle);

impl ConversationalHandle {
    /// Generates a reply given a message history.
    ///
    /// # Errors
    /// Returns `ModelError::Evicted` if the entry has been evicted, or the native error if
    /// generation fails.
    pub fn chat(&self, messages: &[ChatMessage]) -> Result<ModelResponse, ModelError> {
        self.0
            .slot
            .with_native(|native| native.generate_chat_completion(messages))
    }

    /// Returns the untyped handle.
    #[must_use]
    pub fn into_inner(self) -> ModelHandle {
        self.0
    }
}

impl Deref for ConversationalHandle {
    type Target = ModelHandle;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<ModelHandle> for ConversationalHandle {
    type Error = ModelError;

    fn try_from(handle: ModelHandle) -> Result<Self, Self::Error> {
        match handle.kind() {
            ModelKind::Conversational => Ok(Self(handle)),
            ModelKind::Completion => Err(ModelError::UnsupportedOperation(format!(
                "{} is a completion handle, not a conversational one",
                handle.key()
            ))),
        }
    }
}

/// Handle supporting single-shot and structured generation.
#[derive(Debug, Clone)]
pub struct CompletionHandle(ModelHandle);

impl CompletionHandle {
    /// Generates a completion for a single prompt.
    ///
    /// # Errors
    /// Returns `ModelError::Evicted` if the entry has been evicted, or the native error if
    /// generation fails.
    pub fn complete(&self, prompt: &str) -> Result<ModelResponse, ModelError> {
        self.0.generate_text(prompt)
    }

    /// Returns the untyped handle.
    #[must_use]
    pub fn into_inner(self) -> ModelHandle {
        self.0
    }
}

impl Deref for CompletionHandle {
    type Target = ModelHandle;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<ModelHandle> for CompletionHandle {
    type Error = ModelError;

    fn try_from(handle: ModelHandle) -> Result<Self, Self::Error> {
        match handle.kind() {
            ModelKind::Completion => Ok(Self(handle)),
            ModelKind::Conversational => Err(ModelError::UnsupportedOperation(format!(
                "{} is a conversational handle, not a completion one",
                handle.key()
            ))),
        }
    }
}

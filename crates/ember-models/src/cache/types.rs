//! Core data types for model caching.

use chrono::{DateTime, Utc};
use ember_abstraction::ModelKind;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::handle::HandleSlot;

/// Cache key for identifying cached models.
///
/// Models are cached by the pair of handle kind and weights file name. The same file loaded as
/// both kinds occupies two slots and two native contexts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    /// The handle kind.
    pub kind: ModelKind,
    /// The weights file name.
    pub model_name: String,
}

impl CacheKey {
    /// Create a new cache key.
    pub fn new(kind: ModelKind, model_name: impl Into<String>) -> Self {
        Self {
            kind,
            model_name: model_name.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.model_name)
    }
}

/// Identifier assigned to each cache entry when it is created.
///
/// Ids are never reused within a cache, so a reload after eviction yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryId(pub(crate) u64);

impl EntryId {
    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// A cached model entry with metadata.
///
/// The entry exclusively owns its native context. Dropping the entry releases the context
/// immediately, even if callers still hold handles to it; those handles then report
/// `ModelError::Evicted`.
pub(crate) struct CacheEntry {
    /// Shared slot the caller-facing handles point at.
    pub(crate) slot: Arc<HandleSlot>,
    /// GPU memory delta observed while loading.
    pub(crate) vram_bytes: u64,
    /// Timestamp of last access.
    pub(crate) last_used: Instant,
    /// Logical clock value of last access; orders entries with identical timestamps.
    pub(crate) last_used_tick: u64,
    /// Number of times this entry has been handed out.
    pub(crate) access_count: u64,
    /// Wall-clock time the model finished loading.
    pub(crate) loaded_at: DateTime<Utc>,
}

impl CacheEntry {
    pub(crate) fn new(slot: Arc<HandleSlot>, vram_bytes: u64, tick: u64) -> Self {
        Self {
            slot,
            vram_bytes,
            last_used: Instant::now(),
            last_used_tick: tick,
            access_count: 1,
            loaded_at: Utc::now(),
        }
    }

    /// Update the last used timestamp and increment access count.
    pub(crate) fn touch(&mut self, tick: u64) {
        self.last_used = self.last_used.max(Instant::now());
        self.last_used_tick = tick;
        self.access_count += 1;
    }

    /// Recency ordering key; smaller is older.
    pub(crate) fn recency(&self) -> (Instant, u64) {
        (self.last_used, self.last_used_tick)
    }

    pub(crate) fn snapshot(&self, key: &CacheKey) -> EntrySnapshot {
        EntrySnapshot {
            key: key.clone(),
            entry_id: self.slot.entry_id(),
            vram_bytes: self.vram_bytes,
            access_count: self.access_count,
            last_used_tick: self.last_used_tick,
            idle_secs: self.last_used.elapsed().as_secs_f64(),
            loaded_at: self.loaded_at,
        }
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.slot.release();
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("entry_id", &self.slot.entry_id())
            .field("vram_bytes", &self.vram_bytes)
            .field("last_used", &self.last_used)
            .field("access_count", &self.access_count)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Point-in-time view of a cache entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    /// The entry's key.
    pub key: CacheKey,
    /// The entry's id.
    pub entry_id: EntryId,
    /// GPU memory delta observed while loading.
    pub vram_bytes: u64,
    /// Number of times the entry has been handed out.
    pub access_count: u64,
    /// Logical clock value of last access; larger is more recent.
    pub last_used_tick: u64,
    /// Seconds since last access.
    pub idle_secs: f64,
    /// Wall-clock time the model finished loading.
    pub loaded_at: DateTime<Utc>,
}

/// Cache statistics for observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Total number of cache hits.
    pub total_hits: u64,
    /// Total number of cache misses.
    pub total_misses: u64,
    /// Total number of entries evicted to make room for a load.
    pub total_evictions: u64,
    /// Total number of loads the native engine rejected.
    pub total_load_failures: u64,
    /// Current number of models in cache.
    pub cache_size: usize,
    /// Sum of measured VRAM across live entries.
    pub tracked_vram_bytes: u64,
}

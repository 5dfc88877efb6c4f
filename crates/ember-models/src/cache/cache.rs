//! ModelResourceCache implementation with VRAM-aware LRU eviction.

use ember_abstraction::{LoadConfig, ModelKind, ModelLoader, NativeModel};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::error::CacheError;
use super::types::{CacheEntry, CacheKey, CacheStats, EntryId, EntrySnapshot};
use crate::gpu::{GpuMemoryInfo, GpuMemoryProbe, GpuQueryError, bytes_to_mb};
use crate::handle::{CompletionHandle, ConversationalHandle, HandleSlot, ModelHandle};
use crate::silence::StdioSilencer;

/// GPU-memory-aware cache of loaded models.
///
/// One instance is created at startup and shared (`Arc`) with every caller that needs a model.
/// All loads go through [`get_or_load`](Self::get_or_load), which runs lookup, eviction, native
/// construction and registration as a single critical section: loads are serialized, and no
/// two callers can ever reason about the same freed memory.
///
/// Evictions performed to make room for a load are not rolled back if that load fails.
pub struct ModelResourceCache {
    /// Entries, logical clock and statistics, guarded together.
    state: Mutex<CacheState>,
    /// Cache configuration.
    config: CacheConfig,
    /// Source of free/used GPU memory readings.
    probe: Arc<dyn GpuMemoryProbe>,
    /// Native binding used on a cache miss.
    loader: Arc<dyn ModelLoader>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    clock: u64,
    next_entry_id: u64,
    stats: CacheStats,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn allocate_entry_id(&mut self) -> EntryId {
        self.next_entry_id += 1;
        EntryId(self.next_entry_id)
    }

    fn refresh_size(&mut self) {
        self.stats.cache_size = self.entries.len();
        self.stats.tracked_vram_bytes = self.entries.values().map(|e| e.vram_bytes).sum();
    }
}

impl ModelResourceCache {
    /// Create a new model cache.
    ///
    /// The probe is queried once here; a probe that cannot report memory makes the cache
    /// unusable, so the failure is returned instead of being deferred to the first load.
    ///
    /// # Errors
    /// Returns `CacheError::Configuration` if the configuration is invalid, or
    /// `CacheError::ResourceQuery` if the GPU cannot be queried.
    pub fn new(
        config: CacheConfig,
        probe: Arc<dyn GpuMemoryProbe>,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self, CacheError> {
        config.validate().map_err(|e| CacheError::Configuration(e.to_string()))?;

        let info = probe.memory_info()?;
        info!(
            probe = probe.name(),
            model_dir = %config.model_dir.display(),
            total_mb = info.total_mb().round(),
            free_mb = info.free_mb().round(),
            "Model cache initialized"
        );
        log_memory(&info, "init");

        Ok(Self {
            state: Mutex::new(CacheState::default()),
            config,
            probe,
            loader,
        })
    }

    /// Get a model from cache or load it if not present.
    ///
    /// On a hit the entry's last-used time is refreshed and no GPU query is made. On a miss the
    /// file size is used as a memory estimate, least-recently-used entries of any kind are
    /// evicted until the estimate fits (or the cache is empty), and the model is loaded with
    /// native output suppressed unless `config.verbose` is set. The recorded footprint is the
    /// measured change in used GPU memory.
    ///
    /// # Arguments
    /// * `kind` - Handle kind; selects the native binding
    /// * `model_name` - Weights file name
    /// * `model_dir` - Directory override; defaults to the configured model directory
    /// * `config` - Native load parameters
    ///
    /// # Errors
    /// Returns `CacheError::Configuration` if the file cannot be found,
    /// `CacheError::ResourceLoad` if the native load fails, and
    /// `CacheError::ResourceQuery` if GPU memory cannot be queried.
    pub fn get_or_load(
        &self,
        kind: ModelKind,
        model_name: &str,
        model_dir: Option<&Path>,
        config: &LoadConfig,
    ) -> Result<ModelHandle, CacheError> {
        validate_model_name(model_name)?;

        let key = CacheKey::new(kind, model_name);
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let tick = state.tick();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.touch(tick);
            state.stats.total_hits += 1;
            debug!(
                kind = %kind,
                model = %model_name,
                entry = %entry.slot.entry_id(),
                "Reusing cached model"
            );
            return Ok(ModelHandle::new(Arc::clone(&entry.slot)));
        }

        state.stats.total_misses += 1;
        debug!(kind = %kind, model = %model_name, "Cache miss, loading model");

        let path = self.resolve_model_path(model_name, model_dir)?;
        let estimated = self.estimate_model_size(&path);
        self.ensure_vram(state, estimated)?;

        let (native, vram_bytes) = match self.load_native(kind, &path, config) {
            Ok(loaded) => loaded,
            Err(e) => {
                if e.is_resource_load() {
                    state.stats.total_load_failures += 1;
                    warn!(kind = %kind, model = %model_name, error = %e, "Model load failed");
                } else {
                    warn!(
                        kind = %kind,
                        model = %model_name,
                        error = %e,
                        "VRAM query around model load failed"
                    );
                }
                return Err(e);
            }
        };

        let entry_id = state.allocate_entry_id();
        let slot = Arc::new(HandleSlot::new(entry_id, key.clone(), native));
        let entry = CacheEntry::new(Arc::clone(&slot), vram_bytes, tick);
        state.entries.insert(key, entry);
        state.refresh_size();

        info!(
            kind = %kind,
            model = %model_name,
            entry = %entry_id,
            vram_mb = bytes_to_mb(vram_bytes).round(),
            "Model loaded and cached"
        );
        self.log_vram(&format!("after loading {model_name}"));

        Ok(ModelHandle::new(slot))
    }

    /// Get or load a conversational handle.
    ///
    /// # Errors
    /// See [`get_or_load`](Self::get_or_load).
    pub fn get_or_load_conversational(
        &self,
        model_name: &str,
        model_dir: Option<&Path>,
        config: &LoadConfig,
    ) -> Result<ConversationalHandle, CacheError> {
        let handle = self.get_or_load(ModelKind::Conversational, model_name, model_dir, config)?;
        handle.into_conversational().map_err(|source| CacheError::ResourceLoad {
            model: model_name.to_string(),
            kind: ModelKind::Conversational,
            source,
        })
    }

    /// Get or load a completion handle.
    ///
    /// # Errors
    /// See [`get_or_load`](Self::get_or_load).
    pub fn get_or_load_completion(
        &self,
        model_name: &str,
        model_dir: Option<&Path>,
        config: &LoadConfig,
    ) -> Result<CompletionHandle, CacheError> {
        let handle = self.get_or_load(ModelKind::Completion, model_name, model_dir, config)?;
        handle.into_completion().map_err(|source| CacheError::ResourceLoad {
            model: model_name.to_string(),
            kind: ModelKind::Completion,
            source,
        })
    }

    /// Build the full path to a weights file and check that it exists.
    fn resolve_model_path(
        &self,
        model_name: &str,
        model_dir: Option<&Path>,
    ) -> Result<PathBuf, CacheError> {
        let dir = model_dir.unwrap_or(&self.config.model_dir);
        if !dir.is_dir() {
            return Err(CacheError::Configuration(format!(
                "model directory '{}' does not exist",
                dir.display()
            )));
        }

        let path = dir.join(model_name);
        if !path.is_file() {
            return Err(CacheError::Configuration(format!(
                "model file '{}' not found",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Estimate VRAM needed from the file size on disk.
    fn estimate_model_size(&self, path: &Path) -> u64 {
        match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    fallback_mb = bytes_to_mb(self.config.fallback_estimate_bytes).round(),
                    "Cannot stat model file, using fallback estimate"
                );
                self.config.fallback_estimate_bytes
            }
        }
    }

    /// Evict least-recently-used entries until `needed` bytes are free or nothing is left.
    ///
    /// Returns the number of evicted entries.
    fn ensure_vram(&self, state: &mut CacheState, needed: u64) -> Result<usize, CacheError> {
        let mut free = self.probe.free_bytes()?;
        if free >= needed {
            return Ok(0);
        }

        debug!(
            needed_mb = bytes_to_mb(needed).round(),
            free_mb = bytes_to_mb(free).round(),
            "Insufficient free VRAM, evicting LRU models"
        );

        let mut evicted = 0;
        while free < needed {
            let Some(lru_key) = Self::find_lru_key(&state.entries) else {
                warn!(
                    needed_mb = bytes_to_mb(needed).round(),
                    free_mb = bytes_to_mb(free).round(),
                    "Cache empty but free VRAM still insufficient, attempting load anyway"
                );
                break;
            };
            self.evict(state, &lru_key);
            evicted += 1;
            free = self.probe.free_bytes()?;
        }
        Ok(evicted)
    }

    /// Remove one entry and release its native context.
    fn evict(&self, state: &mut CacheState, key: &CacheKey) {
        let Some(entry) = state.entries.remove(key) else {
            return;
        };
        info!(
            kind = %key.kind,
            model = %key.model_name,
            entry = %entry.slot.entry_id(),
            vram_mb = bytes_to_mb(entry.vram_bytes).round(),
            idle_secs = entry.last_used.elapsed().as_secs_f64().round(),
            "Evicting LRU model"
        );
        drop(entry);
        state.stats.total_evictions += 1;
        state.refresh_size();
        self.log_vram("after eviction");
    }

    /// Construct the native model and measure its GPU footprint.
    fn load_native(
        &self,
        kind: ModelKind,
        path: &Path,
        config: &LoadConfig,
    ) -> Result<(Box<dyn NativeModel>, u64), CacheError> {
        let used_before = self.probe.used_bytes()?;

        debug!(
            path = %path.display(),
            kind = %kind,
            n_ctx = config.n_ctx,
            n_gpu_layers = config.n_gpu_layers,
            n_threads = config.resolved_threads(),
            "Constructing native model"
        );

        let loaded = {
            let _silencer = StdioSilencer::unless_verbose(config.verbose);
            self.loader.load(kind, path, config)
        };

        let native = loaded.map_err(|source| CacheError::ResourceLoad {
            model: path.file_name().map_or_else(
                || path.display().to_string(),
                |name| name.to_string_lossy().into_owned(),
            ),
            kind,
            source,
        })?;

        let used_after = self.probe.used_bytes()?;
        Ok((native, used_after.saturating_sub(used_before)))
    }

    /// Find the least-recently-used key in the cache.
    fn find_lru_key(entries: &HashMap<CacheKey, CacheEntry>) -> Option<CacheKey> {
        entries
            .iter()
            .min_by_key(|(_, entry)| entry.recency())
            .map(|(key, _)| key.clone())
    }

    /// Get current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut state = self.lock_state();
        state.refresh_size();
        state.stats.clone()
    }

    /// Snapshot of all entries, least recently used first.
    #[must_use]
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let state = self.lock_state();
        let mut snapshots: Vec<_> = state
            .entries
            .iter()
            .map(|(key, entry)| entry.snapshot(key))
            .collect();
        snapshots.sort_by_key(|s| s.last_used_tick);
        snapshots
    }

    /// Whether an entry exists for the key.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock_state().entries.contains_key(key)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_state().entries.is_empty()
    }

    /// Remove a specific model from the cache, releasing its native context.
    ///
    /// # Returns
    /// `true` if the model was removed, `false` if it was not found.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut state = self.lock_state();
        let removed = state.entries.remove(key);
        let found = removed.is_some();
        drop(removed);
        if found {
            state.refresh_size();
            info!(kind = %key.kind, model = %key.model_name, "Removed model from cache");
            self.log_vram("after removal");
        }
        found
    }

    /// Release every cached model.
    ///
    /// # Returns
    /// The number of entries released.
    pub fn clear(&self) -> usize {
        let mut state = self.lock_state();
        let cleared_count = state.entries.len();
        state.entries.clear();
        state.refresh_size();
        info!(cleared_count, "Cleared all models from cache");
        cleared_count
    }

    /// Current GPU memory reading.
    ///
    /// # Errors
    /// Returns `GpuQueryError` if the device cannot be queried.
    pub fn memory_info(&self) -> Result<GpuMemoryInfo, GpuQueryError> {
        self.probe.memory_info()
    }

    /// Log current VRAM usage at debug level.
    pub fn log_vram(&self, label: &str) {
        match self.probe.memory_info() {
            Ok(info) => log_memory(&info, label),
            Err(e) => warn!(label, error = %e, "VRAM query failed"),
        }
    }

    /// Get the cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The GPU probe backing eviction decisions.
    #[must_use]
    pub fn probe(&self) -> Arc<dyn GpuMemoryProbe> {
        Arc::clone(&self.probe)
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reject names that are empty or reach outside the model directory.
fn validate_model_name(model_name: &str) -> Result<(), CacheError> {
    if model_name.trim().is_empty() {
        return Err(CacheError::Configuration("model name must not be empty".to_string()));
    }

    let mut components = Path::new(model_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(CacheError::Configuration(format!(
            "model name '{model_name}' must be a file name, not a path"
        ))),
    }
}

fn log_memory(info: &GpuMemoryInfo, label: &str) {
    debug!(
        "VRAM [{}]: {:.0}MB / {:.0}MB",
        label,
        info.used_mb(),
        info.total_mb()
    );
}

impl fmt::Debug for ModelResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelResourceCache")
            .field("config", &self.config)
            .field("probe", &self.probe.name())
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLoader, SimulatedGpu};
    use ember_abstraction::ModelError;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        dir: TempDir,
        gpu: Arc<SimulatedGpu>,
        loader: Arc<MockLoader>,
        cache: ModelResourceCache,
    }

    impl Fixture {
        fn load(&self, kind: ModelKind, name: &str) -> Result<ModelHandle, CacheError> {
            self.cache.get_or_load(kind, name, None, &unsilenced())
        }

        fn add_model(&self, name: &str, size_mib: u64) {
            let file = std::fs::File::create(self.dir.path().join(name)).unwrap();
            file.set_len(size_mib * MIB).unwrap();
        }
    }

    fn fixture(total_mib: u64, models: &[(&str, u64)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let gpu = Arc::new(SimulatedGpu::with_mib(total_mib));
        let loader = Arc::new(MockLoader::new(Arc::clone(&gpu)));
        let config = CacheConfig::default().with_model_dir(dir.path());
        let cache = ModelResourceCache::new(config, gpu.clone(), loader.clone()).unwrap();
        let fx = Fixture {
            dir,
            gpu,
            loader,
            cache,
        };
        for (name, size_mib) in models {
            fx.add_model(name, *size_mib);
        }
        fx
    }

    /// Loads with native output left on, so unit tests never redirect the test harness streams.
    fn unsilenced() -> LoadConfig {
        LoadConfig::default().with_verbose(true)
    }

    /// Runs the real load, then makes the probe fail for the measurement that follows it.
    struct GpuFailsAfterLoad {
        inner: MockLoader,
        gpu: Arc<SimulatedGpu>,
    }

    impl ModelLoader for GpuFailsAfterLoad {
        fn load(
            &self,
            kind: ModelKind,
            path: &Path,
            config: &LoadConfig,
        ) -> Result<Box<dyn NativeModel>, ModelError> {
            let model = self.inner.load(kind, path, config);
            self.gpu.set_failing(true);
            model
        }
    }

    #[test]
    fn test_cache_hit_returns_same_entry() {
        let fx = fixture(8192, &[("test.gguf", 100)]);

        let first = fx.load(ModelKind::Completion, "test.gguf").unwrap();
        let queries_after_load = fx.gpu.query_count();
        let second = fx.load(ModelKind::Completion, "test.gguf").unwrap();

        assert_eq!(first.entry_id(), second.entry_id());
        assert!(first.same_entry(&second));
        assert_eq!(fx.loader.load_count(ModelKind::Completion, "test.gguf"), 1);
        assert_eq!(fx.gpu.query_count(), queries_after_load);

        let stats = fx.cache.stats();
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.total_misses, 1);
        assert_eq!(stats.cache_size, 1);
    }

    #[test]
    fn test_kind_isolation() {
        let fx = fixture(8192, &[("weights.gguf", 100)]);

        let chat = fx.load(ModelKind::Conversational, "weights.gguf").unwrap();
        let raw = fx.load(ModelKind::Completion, "weights.gguf").unwrap();

        assert_ne!(chat.entry_id(), raw.entry_id());
        assert!(!chat.same_entry(&raw));
        assert_eq!(fx.cache.len(), 2);
        assert_eq!(fx.loader.total_loads(), 2);
        assert_eq!(fx.gpu.used(), 200 * MIB);
    }

    #[test]
    fn test_lru_eviction_when_vram_short() {
        let fx = fixture(
            3000,
            &[("a.gguf", 1000), ("b.gguf", 1000), ("c.gguf", 1000)],
        );

        let a = fx.load(ModelKind::Completion, "a.gguf").unwrap();
        let b = fx.load(ModelKind::Completion, "b.gguf").unwrap();
        // Refresh a so that b becomes least recently used
        fx.load(ModelKind::Completion, "a.gguf").unwrap();
        let c = fx.load(ModelKind::Completion, "c.gguf").unwrap();

        // 3000 MiB total, all three fit
        assert_eq!(fx.cache.stats().total_evictions, 0);

        fx.add_model("d.gguf", 1000);
        fx.load(ModelKind::Completion, "d.gguf").unwrap();

        let stats = fx.cache.stats();
        assert_eq!(stats.total_evictions, 1);
        assert!(!b.is_loaded());
        assert!(a.is_loaded());
        assert!(c.is_loaded());
        let evicted = CacheKey::new(ModelKind::Completion, "b.gguf");
        assert!(!fx.cache.contains(&evicted));

        // Evicted handles fail instead of touching released memory
        assert!(matches!(
            b.generate_text("hi"),
            Err(ModelError::Evicted { .. })
        ));

        // Reloading b creates a fresh entry
        let b_again = fx.load(ModelKind::Completion, "b.gguf").unwrap();
        assert_ne!(b.entry_id(), b_again.entry_id());
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let fx = fixture(8192, &[("present.gguf", 10)]);
        fx.load(ModelKind::Completion, "present.gguf").unwrap();

        let err = fx.load(ModelKind::Completion, "absent.gguf").unwrap_err();

        assert!(err.is_configuration());
        assert_eq!(fx.cache.len(), 1);
    }

    #[test]
    fn test_empty_model_name_rejected() {
        let fx = fixture(8192, &[]);
        let err = fx.load(ModelKind::Completion, "  ").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_model_name_with_path_components_rejected() {
        let fx = fixture(8192, &[("inside.gguf", 10)]);
        let outside = TempDir::new().unwrap();
        let stray = outside.path().join("outside.gguf");
        std::fs::File::create(&stray).unwrap().set_len(MIB).unwrap();

        let absolute = stray.to_string_lossy().into_owned();
        let nested = format!("sub{}inside.gguf", std::path::MAIN_SEPARATOR);
        for name in [absolute.as_str(), "../inside.gguf", nested.as_str(), ".", ".."] {
            let err = fx.load(ModelKind::Completion, name).unwrap_err();
            assert!(err.is_configuration(), "{name} was accepted");
        }

        assert_eq!(fx.loader.total_loads(), 0);
        assert_eq!(fx.cache.stats().total_misses, 0);
        assert!(fx.load(ModelKind::Completion, "inside.gguf").is_ok());
    }

    #[test]
    fn test_missing_directory_is_configuration_error() {
        let fx = fixture(8192, &[]);
        let missing = fx.dir.path().join("nope");
        let config = unsilenced();
        let err = fx
            .cache
            .get_or_load(ModelKind::Completion, "x.gguf", Some(&missing), &config)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_model_dir_override() {
        let fx = fixture(8192, &[]);
        let other = TempDir::new().unwrap();
        std::fs::File::create(other.path().join("elsewhere.gguf"))
            .unwrap()
            .set_len(MIB)
            .unwrap();

        let handle = fx
            .cache
            .get_or_load(
                ModelKind::Conversational,
                "elsewhere.gguf",
                Some(other.path()),
                &unsilenced(),
            )
            .unwrap();
        assert_eq!(handle.model_name(), "elsewhere.gguf");
    }

    #[test]
    fn test_estimate_uses_file_size() {
        let fx = fixture(8192, &[("sized.gguf", 300)]);
        let path = fx.dir.path().join("sized.gguf");
        assert_eq!(fx.cache.estimate_model_size(&path), 300 * MIB);
    }

    #[test]
    fn test_estimate_falls_back_when_file_cannot_be_read() {
        let fx = fixture(8192, &[]);
        let path = fx.dir.path().join("vanished.gguf");

        let estimate = fx.cache.estimate_model_size(&path);

        assert_eq!(estimate, fx.cache.config().fallback_estimate_bytes);
        assert_eq!(estimate, 2 * 1024 * MIB);
    }

    #[test]
    fn test_load_failure_leaves_no_entry() {
        let fx = fixture(8192, &[("good.gguf", 10), ("corrupt.gguf", 10)]);
        fx.loader.fail_model("corrupt.gguf");

        fx.load(ModelKind::Completion, "good.gguf").unwrap();
        let err = fx.load(ModelKind::Completion, "corrupt.gguf").unwrap_err();

        assert!(err.is_resource_load());
        assert_eq!(fx.cache.len(), 1);
        assert_eq!(fx.cache.stats().total_load_failures, 1);

        // Still usable afterwards
        let again = fx.load(ModelKind::Completion, "good.gguf").unwrap();
        assert!(again.generate_text("still alive").is_ok());
    }

    #[test]
    fn test_query_failure_blocks_eviction_decision() {
        let fx = fixture(8192, &[("a.gguf", 10)]);
        fx.gpu.set_failing(true);

        let err = fx.load(ModelKind::Completion, "a.gguf").unwrap_err();
        assert!(matches!(err, CacheError::ResourceQuery(_)));
        assert!(fx.cache.is_empty());
        assert_eq!(fx.loader.total_loads(), 0);
    }

    #[test]
    fn test_query_failure_after_load_is_not_a_load_failure() {
        let dir = TempDir::new().unwrap();
        std::fs::File::create(dir.path().join("a.gguf"))
            .unwrap()
            .set_len(MIB)
            .unwrap();
        let gpu = Arc::new(SimulatedGpu::with_mib(1024));
        let loader = Arc::new(GpuFailsAfterLoad {
            inner: MockLoader::new(Arc::clone(&gpu)),
            gpu: Arc::clone(&gpu),
        });
        let config = CacheConfig::default().with_model_dir(dir.path());
        let cache = ModelResourceCache::new(config, gpu.clone(), loader).unwrap();

        let err = cache
            .get_or_load(ModelKind::Completion, "a.gguf", None, &unsilenced())
            .unwrap_err();

        assert!(matches!(err, CacheError::ResourceQuery(_)));
        assert_eq!(cache.stats().total_load_failures, 0);
        assert!(cache.is_empty());
        // The unregistered model was dropped, so its memory is back
        assert_eq!(gpu.used(), 0);
    }

    #[test]
    fn test_construction_fails_without_gpu_readings() {
        let gpu = Arc::new(SimulatedGpu::with_mib(1024));
        gpu.set_failing(true);
        let loader = Arc::new(MockLoader::new(Arc::clone(&gpu)));

        let result = ModelResourceCache::new(CacheConfig::default(), gpu, loader);
        assert!(matches!(result, Err(CacheError::ResourceQuery(_))));
    }

    #[test]
    fn test_measured_vram_recorded() {
        let fx = fixture(8192, &[("a.gguf", 512)]);
        fx.loader.set_overhead(64 * MIB);

        fx.load(ModelKind::Conversational, "a.gguf").unwrap();

        let entries = fx.cache.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].vram_bytes, 576 * MIB);
        assert_eq!(fx.cache.stats().tracked_vram_bytes, 576 * MIB);
    }

    #[test]
    fn test_entries_ordered_least_recent_first() {
        let fx = fixture(8192, &[("a.gguf", 1), ("b.gguf", 1), ("c.gguf", 1)]);
        for name in ["a.gguf", "b.gguf", "c.gguf", "a.gguf"] {
            fx.load(ModelKind::Completion, name).unwrap();
        }

        let order: Vec<_> = fx
            .cache
            .entries()
            .into_iter()
            .map(|e| e.key.model_name)
            .collect();
        assert_eq!(order, vec!["b.gguf", "c.gguf", "a.gguf"]);
    }

    #[test]
    fn test_cache_clear_releases_memory() {
        let fx = fixture(8192, &[("model-1.gguf", 100), ("model-2.gguf", 100)]);
        let h1 = fx.load(ModelKind::Completion, "model-1.gguf").unwrap();
        fx.load(ModelKind::Conversational, "model-2.gguf").unwrap();
        assert_eq!(fx.cache.stats().cache_size, 2);

        assert_eq!(fx.cache.clear(), 2);

        assert_eq!(fx.cache.stats().cache_size, 0);
        assert_eq!(fx.gpu.used(), 0);
        assert!(!h1.is_loaded());
    }

    #[test]
    fn test_cache_remove() {
        let fx = fixture(8192, &[("test-model.gguf", 100)]);
        let key = CacheKey::new(ModelKind::Conversational, "test-model.gguf");

        fx.load(key.kind, &key.model_name).unwrap();
        assert_eq!(fx.cache.stats().cache_size, 1);

        assert!(fx.cache.remove(&key));
        assert_eq!(fx.cache.stats().cache_size, 0);
        assert_eq!(fx.gpu.used(), 0);

        assert!(!fx.cache.remove(&key));
    }

    #[test]
    fn test_typed_entry_points() {
        let fx = fixture(8192, &[("chat.gguf", 1)]);
        let chat = fx
            .cache
            .get_or_load_conversational("chat.gguf", None, &unsilenced())
            .unwrap();
        let raw = fx
            .cache
            .get_or_load_completion("chat.gguf", None, &unsilenced())
            .unwrap();

        assert_eq!(chat.kind(), ModelKind::Conversational);
        assert_eq!(raw.kind(), ModelKind::Completion);
        assert_eq!(fx.cache.len(), 2);
    }
}

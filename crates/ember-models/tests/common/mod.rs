//! Shared fixtures for integration tests.

#![allow(dead_code)]

use ember_models::{
    CacheConfig, CacheError, LoadConfig, MockLoader, ModelHandle, ModelKind, ModelResourceCache,
    SimulatedGpu,
};
use std::sync::Arc;
use tempfile::TempDir;

pub const MIB: u64 = 1024 * 1024;

/// A model directory, a simulated GPU and a cache wired together.
pub struct TestBed {
    pub dir: TempDir,
    pub gpu: Arc<SimulatedGpu>,
    pub loader: Arc<MockLoader>,
    pub cache: Arc<ModelResourceCache>,
}

impl TestBed {
    pub fn new(total_mib: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let gpu = Arc::new(SimulatedGpu::with_mib(total_mib));
        let loader = Arc::new(MockLoader::new(Arc::clone(&gpu)));
        let config = CacheConfig::default().with_model_dir(dir.path());
        let cache = ModelResourceCache::new(config, gpu.clone(), loader.clone())
            .map(Arc::new)
            .unwrap();
        Self {
            dir,
            gpu,
            loader,
            cache,
        }
    }

    /// Creates a sparse weights file of `size_mib` MiB.
    pub fn add_model(&self, name: &str, size_mib: u64) -> &Self {
        let file = std::fs::File::create(self.dir.path().join(name)).unwrap();
        file.set_len(size_mib * MIB).unwrap();
        self
    }

    /// Loads with native output left alone, so parallel tests cannot interfere through stdio.
    pub fn load(&self, kind: ModelKind, name: &str) -> Result<ModelHandle, CacheError> {
        let config = LoadConfig::for_kind(kind).with_verbose(true);
        self.cache.get_or_load(kind, name, None, &config)
    }

    pub fn cached_names(&self) -> Vec<String> {
        self.cache
            .entries()
            .into_iter()
            .map(|e| e.key.model_name)
            .collect()
    }
}

//! Integration tests for stdout/stderr suppression during native loads.
//!
//! Redirection is process-wide, so every test here holds `STDIO_LOCK` and compares descriptor
//! targets by device and inode.

#![cfg(unix)]

mod common;

use common::MIB;
use ember_models::{
    CacheConfig, LoadConfig, MockLoader, ModelError, ModelKind, ModelLoader, ModelResourceCache,
    NativeModel, SimulatedGpu,
};
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;

static STDIO_LOCK: Mutex<()> = Mutex::new(());

type Identity = (u64, u64);

fn identity(fd: impl AsFd) -> Identity {
    let file = File::from(fd.as_fd().try_clone_to_owned().unwrap());
    let meta = file.metadata().unwrap();
    (meta.dev(), meta.ino())
}

fn devnull() -> Identity {
    let meta = std::fs::metadata("/dev/null").unwrap();
    (meta.dev(), meta.ino())
}

fn streams() -> (Identity, Identity) {
    (identity(io::stdout()), identity(io::stderr()))
}

/// Records where the streams point while the native load runs.
struct ObservingLoader {
    inner: MockLoader,
    seen: Mutex<Vec<(Identity, Identity)>>,
}

impl ModelLoader for ObservingLoader {
    fn load(
        &self,
        kind: ModelKind,
        path: &Path,
        config: &LoadConfig,
    ) -> Result<Box<dyn NativeModel>, ModelError> {
        self.seen.lock().unwrap().push(streams());
        self.inner.load(kind, path, config)
    }
}

/// Aborts initialization the hard way.
struct PanickingLoader;

impl ModelLoader for PanickingLoader {
    fn load(
        &self,
        _kind: ModelKind,
        path: &Path,
        _config: &LoadConfig,
    ) -> Result<Box<dyn NativeModel>, ModelError> {
        panic!("native abort while loading {}", path.display());
    }
}

fn model_dir(names: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for name in names {
        File::create(dir.path().join(name)).unwrap().set_len(MIB).unwrap();
    }
    dir
}

#[test]
fn test_streams_silenced_during_load_and_restored_after() {
    let _lock = STDIO_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let before = streams();

    let dir = model_dir(&["ok.gguf", "bad.gguf"]);
    let gpu = Arc::new(SimulatedGpu::with_mib(1024));
    let inner = MockLoader::new(Arc::clone(&gpu));
    inner.fail_model("bad.gguf");
    let loader = Arc::new(ObservingLoader {
        inner,
        seen: Mutex::new(Vec::new()),
    });
    let cache = ModelResourceCache::new(
        CacheConfig::default().with_model_dir(dir.path()),
        gpu,
        loader.clone(),
    )
    .unwrap();

    let quiet = LoadConfig::completion();
    let load = |name: &str| cache.get_or_load(ModelKind::Completion, name, None, &quiet);

    load("ok.gguf").unwrap();
    assert_eq!(streams(), before);

    assert!(load("bad.gguf").is_err());
    assert_eq!(streams(), before);

    assert!(load("absent.gguf").is_err());
    assert_eq!(streams(), before);

    let silenced = (devnull(), devnull());
    let seen = loader.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|&observed| observed == silenced));
}

#[test]
fn test_verbose_load_leaves_streams_alone() {
    let _lock = STDIO_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let before = streams();

    let dir = model_dir(&["chatty.gguf"]);
    let gpu = Arc::new(SimulatedGpu::with_mib(1024));
    let loader = Arc::new(ObservingLoader {
        inner: MockLoader::new(Arc::clone(&gpu)),
        seen: Mutex::new(Vec::new()),
    });
    let cache = ModelResourceCache::new(
        CacheConfig::default().with_model_dir(dir.path()),
        gpu,
        loader.clone(),
    )
    .unwrap();

    let verbose = LoadConfig::conversational().with_verbose(true);
    cache
        .get_or_load(ModelKind::Conversational, "chatty.gguf", None, &verbose)
        .unwrap();

    assert_eq!(loader.seen.lock().unwrap().as_slice(), &[before]);
    assert_eq!(streams(), before);
}

#[test]
fn test_streams_restored_when_native_load_panics() {
    let _lock = STDIO_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let before = streams();

    let dir = model_dir(&["boom.gguf"]);
    let cache = Arc::new(
        ModelResourceCache::new(
            CacheConfig::default().with_model_dir(dir.path()),
            Arc::new(SimulatedGpu::with_mib(1024)),
            Arc::new(PanickingLoader),
        )
        .unwrap(),
    );

    let worker = Arc::clone(&cache);
    let result = std::thread::spawn(move || {
        let config = LoadConfig::completion();
        worker.get_or_load(ModelKind::Completion, "boom.gguf", None, &config)
    })
    .join();

    assert!(result.is_err());
    assert_eq!(streams(), before);

    // The cache recovers from the poisoned lock and stays usable
    assert!(cache.is_empty());
    assert_eq!(cache.stats().total_misses, 1);
}

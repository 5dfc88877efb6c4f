//! End-to-end startup: workspace config, `.env` inventory, cache and monitor.

use ember_models::inventory::{model_dir_from_env_file, parse_env_models};
use ember_models::{
    CacheConfig, LoadConfig, MockLoader, ModelInventory, ModelKind, ModelResourceCache,
    ResourceMonitor, SimulatedGpu, load_cache_config_with,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_startup_from_workspace_files() {
    let workspace = TempDir::new().unwrap();
    let models = workspace.path().join("gguf");

    std::fs::create_dir_all(workspace.path().join(".ember")).unwrap();
    std::fs::write(
        workspace.path().join(".ember/config.toml"),
        format!(
            "[models.cache]\nmodel_dir = \"{}\"\nmonitor_interval_secs = 1\n",
            models.display()
        ),
    )
    .unwrap();
    std::fs::write(
        workspace.path().join(".env"),
        format!(
            "MODEL_PATH=\"{}\"\n\
             MODEL_QWEN=qwen2.5-1.5b-instruct-fp16.gguf\n\
             MODEL_PHI=phi-4-Q5_0.gguf\n",
            models.display()
        ),
    )
    .unwrap();

    let config = load_cache_config_with(workspace.path(), |_| None).unwrap();
    assert_eq!(config.model_dir, models);

    let env = workspace.path().join(".env");
    let model_dir = model_dir_from_env_file(&env);
    let declared = parse_env_models(&env);
    let inventory = ModelInventory::check(&model_dir, &declared).unwrap();
    assert_eq!(inventory.missing.len(), 2);

    std::fs::File::create(models.join("qwen2.5-1.5b-instruct-fp16.gguf"))
        .unwrap()
        .set_len(64 * 1024 * 1024)
        .unwrap();
    let inventory = ModelInventory::check(&model_dir, &declared).unwrap();
    assert_eq!(inventory.present.len(), 1);

    let gpu = Arc::new(SimulatedGpu::with_mib(2048));
    let loader = Arc::new(MockLoader::new(Arc::clone(&gpu)));
    let cache = ModelResourceCache::new(config, gpu.clone(), loader)
        .map(Arc::new)
        .unwrap();

    let mut monitor = ResourceMonitor::new(gpu, Duration::from_millis(10));
    monitor.start().unwrap();

    let cache_for_load = Arc::clone(&cache);
    let handle = tokio::task::spawn_blocking(move || {
        let config = LoadConfig::conversational().with_verbose(true);
        cache_for_load
            .get_or_load_conversational("qwen2.5-1.5b-instruct-fp16.gguf", None, &config)
            .unwrap()
    })
    .await
    .unwrap();
    assert_eq!(handle.kind(), ModelKind::Conversational);

    tokio::time::sleep(Duration::from_millis(60)).await;
    monitor.stop().await.unwrap();

    let sample = monitor.latest().unwrap();
    assert_eq!(sample.vram.unwrap().used, 64 * 1024 * 1024);
    assert_eq!(cache.config().model_dir, models);
}

#[test]
fn test_model_path_env_override_applies_after_file() -> anyhow::Result<()> {
    let workspace = TempDir::new()?;
    std::fs::create_dir_all(workspace.path().join(".ember"))?;
    std::fs::write(
        workspace.path().join(".ember/config.toml"),
        "[models.cache]\nmodel_dir = \"/opt/gguf\"\n",
    )?;

    let config = load_cache_config_with(workspace.path(), |name| {
        (name == "MODEL_PATH").then(|| "/mnt/models".to_string())
    })?;

    assert_eq!(config.model_dir, PathBuf::from("/mnt/models"));
    assert_eq!(config, CacheConfig::default().with_model_dir("/mnt/models"));
    Ok(())
}

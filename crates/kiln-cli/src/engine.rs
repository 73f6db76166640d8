//! Wiring of stores, executors and the orchestrator from configuration.

use crate::config::EngineConfig;
use anyhow::Context;
use kiln_cache::{CacheKeyResolver, FilesystemCacheStore, FilesystemWorkspaceStore};
use kiln_core::pipeline::PipelineDefinition;
use kiln_runner::{ExecutorPool, JobRunner, LocalExecutor};
use kiln_scheduler::{Orchestrator, Scheduler};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub struct Engine {
    pub config: EngineConfig,
    pub orchestrator: Orchestrator,
}

/// Load and parse the pipeline definition.
pub fn load_pipeline(path: &Path) -> anyhow::Result<PipelineDefinition> {
    PipelineDefinition::load(path)
        .with_context(|| format!("Failed to load pipeline {}", path.display()))
}

pub async fn open_cache(config: &EngineConfig) -> anyhow::Result<FilesystemCacheStore> {
    FilesystemCacheStore::open(&config.cache.root, config.cache.retention.clone())
        .await
        .with_context(|| format!("Failed to open cache at {}", config.cache.root.display()))
}

impl Engine {
    pub async fn start(config: EngineConfig, pipeline: PipelineDefinition) -> anyhow::Result<Self> {
        let cache = Arc::new(open_cache(&config).await?);
        let workspaces = Arc::new(
            FilesystemWorkspaceStore::new(&config.workspace.root)
                .with_compression(config.workspace.compression),
        );
        let executor = Arc::new(LocalExecutor::new(config.executor.clone()));
        let pool = Arc::new(ExecutorPool::new(executor, config.pool.clone()));
        let resolver = CacheKeyResolver::new(cache).with_compression(config.cache.compression);
        let runner = Arc::new(JobRunner::new(
            pool,
            resolver,
            workspaces.clone(),
            config.runner.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(runner, config.scheduler.clone()));
        let orchestrator = Orchestrator::new(
            Arc::new(pipeline),
            scheduler,
            workspaces,
            config.orchestrator(),
        )?;

        debug!(
            cache_root = %config.cache.root.display(),
            workspace_root = %config.workspace.root.display(),
            "Engine started"
        );
        Ok(Self {
            config,
            orchestrator,
        })
    }
}

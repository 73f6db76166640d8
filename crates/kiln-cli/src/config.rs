//! Engine configuration.
//!
//! Loaded from an optional YAML file and `KILN__*` environment variables,
//! e.g. `KILN__POOL__DEFAULT_CAPACITY=8` or `KILN__CACHE__ROOT=/var/cache/kiln`.

use anyhow::Context;
use config::{Config, Environment, File, FileFormat};
use kiln_cache::{Compression, RetentionPolicy};
use kiln_runner::{JobRunnerConfig, LocalExecutorConfig, PoolConfig};
use kiln_scheduler::{OrchestratorConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pipeline definition file.
    pub pipeline: PathBuf,
    /// Branch for manual and scheduled runs that name none.
    pub default_branch: String,
    /// Daemon wake-up interval.
    pub tick_interval_secs: u64,
    pub pool: PoolConfig,
    pub executor: LocalExecutorConfig,
    pub runner: JobRunnerConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub compression: Compression,
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    pub compression: Compression,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "kiln", "kiln")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline: PathBuf::from("kiln.yaml"),
            default_branch: "main".to_string(),
            tick_interval_secs: 15,
            pool: PoolConfig::default(),
            executor: LocalExecutorConfig::default(),
            runner: JobRunnerConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            workspace: WorkspaceConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let root = project_dirs()
            .map(|dirs| dirs.cache_dir().join("cache"))
            .unwrap_or_else(|| std::env::temp_dir().join("kiln-cache"));
        Self {
            root,
            compression: Compression::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        let root = project_dirs()
            .map(|dirs| dirs.data_local_dir().join("workspaces"))
            .unwrap_or_else(|| std::env::temp_dir().join("kiln-workspaces"));
        Self {
            root,
            compression: Compression::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration. An explicit `path` must exist; the default file
    /// in the user config directory is optional.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(
                    File::from(path.to_path_buf())
                        .format(FileFormat::Yaml)
                        .required(true),
                );
            }
            None => {
                if let Some(default) = Self::default_path() {
                    builder = builder.add_source(
                        File::from(default).format(FileFormat::Yaml).required(false),
                    );
                }
            }
        }
        builder = builder.add_source(
            Environment::with_prefix("KILN")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().context("Failed to read configuration")?;
        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Default configuration file path.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_branch: self.default_branch.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.yaml");
        std::fs::write(
            &path,
            r#"
default_branch: master
pool:
  default_capacity: 2
  capacities: { mac: 1 }
cache:
  root: /tmp/kiln-test-cache
  retention: { max_entries_per_key: 5 }
scheduler:
  max_parallel_jobs: 3
"#,
        )
        .unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();

        assert_eq!(config.default_branch, "master");
        assert_eq!(config.pool.default_capacity, 2);
        assert_eq!(config.pool.capacity_for("mac"), 1);
        assert_eq!(config.pool.capacity_for("linux"), 2);
        assert_eq!(config.cache.root, PathBuf::from("/tmp/kiln-test-cache"));
        assert_eq!(config.cache.retention.max_entries_per_key, 5);
        assert_eq!(
            config.cache.retention.max_age_days,
            RetentionPolicy::default().max_age_days
        );
        assert_eq!(config.scheduler.max_parallel_jobs, Some(3));
        assert_eq!(config.tick_interval_secs, 15);
        assert_eq!(config.orchestrator().default_branch, "master");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EngineConfig::load(Some(&dir.path().join("absent.yaml"))).is_err());
    }
}

//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and
//! external adapters: cache and workspace storage, executors, and the job
//! runner as seen by the scheduler.

use crate::cache::{CacheEntry, CacheHit};
use crate::ids::{ExecutorId, JobName, RunId, SnapshotId};
use crate::job::Job;
use crate::pipeline::EnvironmentDescriptor;
use crate::run::{JobOutcome, RunContext};
use crate::workspace::SnapshotInfo;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Opaque key-value blob store for build caches.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Most recent entry saved under exactly `key`.
    async fn get(&self, key: &str) -> Result<Option<CacheHit>>;

    /// Most recent entry whose key starts with `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Option<CacheHit>>;

    /// Store a payload as a new entry; never overwrites an existing one.
    async fn put(&self, key: &str, suffix: &str, payload: Vec<u8>) -> Result<CacheEntry>;

    /// List entries, optionally restricted to a key prefix.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<CacheEntry>>;

    /// Delete one stored entry.
    async fn delete(&self, entry: &CacheEntry) -> Result<()>;

    /// Apply the store's retention policy; returns the evicted entries.
    async fn prune(&self) -> Result<Vec<CacheEntry>>;
}

/// Run-scoped storage for directory trees handed between jobs.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Persist `paths` (relative to `root`) as a snapshot owned by `job`.
    async fn persist(
        &self,
        run_id: RunId,
        job: &JobName,
        root: &Path,
        paths: &[String],
    ) -> Result<SnapshotInfo>;

    /// Materialize a snapshot of the same run under `mount_root`.
    async fn attach(&self, run_id: RunId, snapshot_id: SnapshotId, mount_root: &Path)
    -> Result<()>;

    /// Snapshots of a run, oldest first.
    async fn snapshots(&self, run_id: RunId) -> Result<Vec<SnapshotInfo>>;

    /// Drop every snapshot of a run.
    async fn discard(&self, run_id: RunId) -> Result<()>;
}

/// An acquired, isolated execution context.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub id: ExecutorId,
    pub environment: String,
    pub descriptor: EnvironmentDescriptor,
    pub workdir: PathBuf,
}

/// A command to run inside an execution context.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub script: String,
    pub shell: String,
    /// Relative to the context's workdir.
    pub working_directory: Option<String>,
    pub env: HashMap<String, String>,
}

/// Output line from command execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Result of a finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Machine/sandbox provider.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Acquire a fresh context for an environment.
    async fn acquire(
        &self,
        environment: &str,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<ExecutionContext>;

    /// Run a command, streaming its output. Dropping the future kills the command.
    async fn run(
        &self,
        ctx: &ExecutionContext,
        command: &CommandSpec,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<CommandResult>;

    /// Tear a context down.
    async fn release(&self, ctx: ExecutionContext) -> Result<()>;
}

/// Per-dispatch information handed to the job runner.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run: RunContext,
    /// Transitive dependencies of the job, in topological order.
    pub upstream: Vec<JobName>,
    /// Flips to `true` when the run is aborted.
    pub cancel: watch::Receiver<bool>,
}

/// How the scheduler hands a ready job to whatever executes it.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Execute a job to completion. Failures are reported in the outcome.
    async fn dispatch(&self, job: Arc<Job>, ctx: JobContext) -> JobOutcome;
}

/// Resolve once the cancel flag is raised. Never resolves if the sender is
/// dropped without cancelling.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

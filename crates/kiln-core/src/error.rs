//! Error types for Kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run cancelled: {reason}")]
    RunCancelled { reason: String },

    #[error("Run timeout after {seconds} seconds")]
    RunTimeout { seconds: u64 },

    // Executor errors
    #[error("No executor available for environment '{environment}': {message}")]
    ExecutorUnavailable { environment: String, message: String },

    #[error("Executor context lost: {0}")]
    ExecutorLost(String),

    // Step errors
    #[error("Step '{step}' failed with exit code {exit_code}")]
    StepFailed { step: String, exit_code: i32 },

    #[error("Job timeout after {seconds} seconds")]
    JobTimeout { seconds: u64 },

    // Cache errors
    #[error("Invalid cache key template '{template}': {message}")]
    InvalidKeyTemplate { template: String, message: String },

    #[error("Cache error: {0}")]
    Cache(String),

    // Workspace errors
    #[error("Workspace snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidPipeline(err.to_string())
    }
}

impl Error {
    /// Whether this error comes from the cache store or key rendering.
    pub fn is_cache(&self) -> bool {
        matches!(self, Error::Cache(_) | Error::InvalidKeyTemplate { .. })
    }

    /// Whether this error comes from the workspace store.
    pub fn is_workspace(&self) -> bool {
        matches!(self, Error::Workspace(_) | Error::SnapshotNotFound(_))
    }
}

//! Job execution for Kiln.
//!
//! [`LocalExecutor`] runs steps as host processes inside a per-job sandbox,
//! [`ExecutorPool`] bounds how many contexts each environment may hold, and
//! [`JobRunner`] drives one job from workspace attach to cache save.

pub mod job;
pub mod local;
pub mod pool;

pub use job::{JobRunner, JobRunnerConfig};
pub use local::{LocalExecutor, LocalExecutorConfig};
pub use pool::{ExecutorPool, PoolConfig, PooledContext};

//! Workflow orchestration for Kiln.
//!
//! - [`dag`]: builds and validates the job graph of a workflow
//! - [`scheduler`]: walks one run's graph, dispatching ready jobs and
//!   cascading skips past failures
//! - [`triggers`]: matches push events and cron ticks against workflows
//! - [`registry`]: the process-wide [`Orchestrator`] owning active runs

pub mod dag;
pub mod registry;
pub mod scheduler;
pub mod triggers;

pub use dag::{DagBuilder, GraphError, GraphErrorKind, WorkflowDag};
pub use registry::{ActiveRun, Orchestrator, OrchestratorConfig, RunHandle, ScheduleEntry};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use triggers::{CronSchedule, TriggerEvent, TriggerMatcher};

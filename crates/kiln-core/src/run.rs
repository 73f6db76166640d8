//! Run and execution types.

use crate::ids::{JobName, RunId};
use crate::pipeline::TriggerType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What caused a run to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger_type: TriggerType,
    pub branch: String,
    pub revision: Option<String>,
    /// Fire time for scheduled runs.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl TriggerInfo {
    pub fn push(branch: impl Into<String>, revision: Option<String>) -> Self {
        Self {
            trigger_type: TriggerType::Push,
            branch: branch.into(),
            revision,
            scheduled_at: None,
        }
    }

    pub fn schedule(branch: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            trigger_type: TriggerType::Schedule,
            branch: branch.into(),
            revision: None,
            scheduled_at: Some(at),
        }
    }

    pub fn manual(branch: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            branch: branch.into(),
            revision: None,
            scheduled_at: None,
        }
    }
}

/// Identity of one run, handed to every job it dispatches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub workflow: String,
    pub trigger: TriggerInfo,
}

impl RunContext {
    pub fn new(workflow: impl Into<String>, trigger: TriggerInfo) -> Self {
        Self {
            run_id: RunId::new(),
            workflow: workflow.into(),
            trigger,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Why a job failed, or why a run failed as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    GraphError,
    ExecutorUnavailable,
    StepFailure,
    Timeout,
    Cancelled,
    Internal,
}

/// Why a job was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A required job failed or was itself skipped because of a failure.
    DependencyFailed { dependency: JobName },
    /// The job's own branch filter rejected the run's branch.
    BranchFiltered,
    /// The run was cancelled or timed out before the job started.
    RunAborted,
}

impl SkipReason {
    /// Filtered jobs count as success for downstream gating.
    pub fn unblocks_dependents(&self) -> bool {
        matches!(self, SkipReason::BranchFiltered)
    }
}

/// Result of one step inside a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Terminal result reported by the job runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub reason: Option<FailureReason>,
    pub message: Option<String>,
    pub steps: Vec<StepOutcome>,
    /// Tail of the captured step output.
    pub output: Vec<String>,
    pub duration_ms: u64,
}

impl JobOutcome {
    pub fn succeeded(steps: Vec<StepOutcome>, output: Vec<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            reason: None,
            message: None,
            steps,
            output,
            duration_ms,
        }
    }

    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            message: Some(message.into()),
            steps: vec![],
            output: vec![],
            duration_ms: 0,
        }
    }

    pub fn with_steps(mut self, steps: Vec<StepOutcome>, output: Vec<String>) -> Self {
        self.steps = steps;
        self.output = output;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Per-job row of a run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: JobName,
    pub status: JobStatus,
    pub reason: Option<FailureReason>,
    pub skip: Option<SkipReason>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepOutcome>,
    pub output: Vec<String>,
}

impl JobRecord {
    pub fn pending(name: JobName) -> Self {
        Self {
            name,
            status: JobStatus::Pending,
            reason: None,
            skip: None,
            message: None,
            started_at: None,
            finished_at: None,
            steps: vec![],
            output: vec![],
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// First failure of a run, used for the diagnostic line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDiagnostic {
    pub job: Option<JobName>,
    pub reason: FailureReason,
    pub message: String,
}

/// Final roll-up of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub context: RunContext,
    pub status: RunStatus,
    pub reason: Option<FailureReason>,
    /// Jobs in topological order.
    pub jobs: Vec<JobRecord>,
    pub first_failure: Option<FailureDiagnostic>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn job(&self, name: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.name.as_str() == name)
    }

    pub fn job_status(&self, name: &str) -> Option<JobStatus> {
        self.job(name).map(|j| j.status)
    }

    /// Process exit code for the CLI: 0 when nothing failed.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            _ => 1,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Report for a run that never dispatched anything.
    pub fn aborted(context: RunContext, reason: FailureReason, message: impl Into<String>) -> Self {
        let now = Utc::now();
        let status = if reason == FailureReason::Cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        Self {
            context,
            status,
            reason: Some(reason),
            jobs: vec![],
            first_failure: Some(FailureDiagnostic {
                job: None,
                reason,
                message: message.into(),
            }),
            started_at: now,
            finished_at: now,
        }
    }
}

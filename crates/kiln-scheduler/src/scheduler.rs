//! Run execution over a workflow graph.
//!
//! Every job carries a tagged status. After each completion the scheduler
//! re-evaluates the graph in topological order until nothing changes:
//! pending jobs whose requirements all passed are dispatched (or skipped by
//! their own branch filter) and pending jobs downstream of a failure are
//! skipped without running. Unrelated branches of the graph keep going.

use crate::dag::WorkflowDag;
use chrono::Utc;
use futures::FutureExt;
use kiln_core::job::Job;
use kiln_core::ports::{self, JobContext, JobDispatcher};
use kiln_core::run::{
    FailureDiagnostic, FailureReason, JobOutcome, JobRecord, JobStatus, RunContext, RunReport,
    RunStatus, SkipReason,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running jobs per run, on top of pool capacity.
    pub max_parallel_jobs: Option<usize>,
    /// How long running jobs get to wind down after an abort before their
    /// tasks are dropped.
    pub cancel_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: None,
            cancel_grace_secs: 30,
        }
    }
}

pub struct Scheduler {
    dispatcher: Arc<dyn JobDispatcher>,
    config: SchedulerConfig,
}

/// Why a run stopped dispatching early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Timeout,
    Cancelled,
}

impl Abort {
    fn reason(self) -> FailureReason {
        match self {
            Abort::Timeout => FailureReason::Timeout,
            Abort::Cancelled => FailureReason::Cancelled,
        }
    }
}

/// Mutable state of one run.
struct RunState<'a> {
    dag: &'a WorkflowDag,
    ctx: &'a RunContext,
    /// Jobs in topological order.
    order: Vec<Arc<Job>>,
    position: HashMap<String, usize>,
    records: Vec<JobRecord>,
    first_failure: Option<FailureDiagnostic>,
}

impl<'a> RunState<'a> {
    fn new(dag: &'a WorkflowDag, ctx: &'a RunContext) -> Self {
        let order: Vec<Arc<Job>> = dag.topological_order().into_iter().cloned().collect();
        let position = order
            .iter()
            .enumerate()
            .map(|(pos, job)| (job.name.to_string(), pos))
            .collect();
        let records = order.iter().map(|job| JobRecord::pending(job.name.clone())).collect();
        Self {
            dag,
            ctx,
            order,
            position,
            records,
            first_failure: None,
        }
    }

    fn skip(&mut self, pos: usize, skip: SkipReason, message: String) {
        let record = &mut self.records[pos];
        info!(
            run_id = %self.ctx.run_id,
            job = %record.name,
            reason = ?skip,
            "Job skipped"
        );
        record.status = JobStatus::Skipped;
        record.skip = Some(skip);
        record.message = Some(message);
        record.finished_at = Some(Utc::now());
    }

    fn fail(&mut self, pos: usize, reason: FailureReason, message: String) {
        let record = &mut self.records[pos];
        record.status = JobStatus::Failed;
        record.reason = Some(reason);
        record.message = Some(message.clone());
        record.finished_at = Some(Utc::now());
        if self.first_failure.is_none() {
            self.first_failure = Some(FailureDiagnostic {
                job: Some(record.name.clone()),
                reason,
                message,
            });
        }
    }

    /// Evaluate one pending job against its requirements.
    ///
    /// `Some(true)` means ready to run, `Some(false)` that it was resolved
    /// without running, `None` that it must keep waiting.
    fn evaluate(&mut self, pos: usize) -> Option<bool> {
        let job = self.order[pos].clone();
        let mut waiting = false;
        for dep in &job.requires {
            let Some(&dep_pos) = self.position.get(dep.as_str()) else {
                continue;
            };
            let dep_record = &self.records[dep_pos];
            match dep_record.status {
                JobStatus::Succeeded => {}
                JobStatus::Skipped
                    if dep_record.skip.as_ref().is_some_and(SkipReason::unblocks_dependents) => {}
                JobStatus::Failed | JobStatus::Skipped => {
                    let dependency = dep_record.name.clone();
                    let message = format!("required job '{dependency}' did not succeed");
                    self.skip(pos, SkipReason::DependencyFailed { dependency }, message);
                    return Some(false);
                }
                JobStatus::Pending | JobStatus::Running => waiting = true,
            }
        }
        if waiting {
            return None;
        }
        if !job.accepts_branch(&self.ctx.trigger.branch) {
            let message = format!("branch '{}' filtered out", self.ctx.trigger.branch);
            self.skip(pos, SkipReason::BranchFiltered, message);
            return Some(false);
        }
        Some(true)
    }

    /// Fixed-point pass: returns positions that became ready.
    fn ready(&mut self) -> Vec<usize> {
        let mut ready = vec![];
        loop {
            let mut changed = false;
            for pos in 0..self.order.len() {
                if self.records[pos].status != JobStatus::Pending || ready.contains(&pos) {
                    continue;
                }
                match self.evaluate(pos) {
                    Some(true) => ready.push(pos),
                    Some(false) => changed = true,
                    None => {}
                }
            }
            if !changed {
                return ready;
            }
        }
    }

    fn complete(&mut self, pos: usize, outcome: JobOutcome, abort: Option<Abort>) {
        {
            let record = &mut self.records[pos];
            record.steps = outcome.steps;
            record.output = outcome.output;
        }
        if outcome.success {
            let record = &mut self.records[pos];
            record.status = JobStatus::Succeeded;
            record.finished_at = Some(Utc::now());
            info!(
                run_id = %self.ctx.run_id,
                job = %record.name,
                duration_ms = outcome.duration_ms,
                "Job succeeded"
            );
            return;
        }

        let mut reason = outcome.reason.unwrap_or(FailureReason::Internal);
        if reason == FailureReason::Cancelled {
            if let Some(abort) = abort {
                reason = abort.reason();
            }
        }
        let message = outcome
            .message
            .unwrap_or_else(|| "job failed".to_string());
        warn!(
            run_id = %self.ctx.run_id,
            job = %self.records[pos].name,
            reason = ?reason,
            message = %message,
            "Job failed"
        );
        self.fail(pos, reason, message);
    }

    fn abort_pending(&mut self, abort: Abort) {
        let message = match abort {
            Abort::Timeout => "run timed out before the job started",
            Abort::Cancelled => "run cancelled before the job started",
        };
        for pos in 0..self.records.len() {
            if self.records[pos].status == JobStatus::Pending {
                self.skip(pos, SkipReason::RunAborted, message.to_string());
            }
        }
    }

    fn into_report(self, started_at: chrono::DateTime<Utc>, abort: Option<Abort>) -> RunReport {
        let any_failed = self.records.iter().any(|r| r.status == JobStatus::Failed);
        let (status, reason) = match abort {
            Some(Abort::Cancelled) => (RunStatus::Cancelled, Some(FailureReason::Cancelled)),
            Some(Abort::Timeout) => (RunStatus::Failed, Some(FailureReason::Timeout)),
            None if any_failed => (
                RunStatus::Failed,
                self.first_failure.as_ref().map(|f| f.reason),
            ),
            None => (RunStatus::Succeeded, None),
        };
        let first_failure = self.first_failure.or_else(|| {
            abort.map(|a| FailureDiagnostic {
                job: None,
                reason: a.reason(),
                message: match a {
                    Abort::Timeout => format!(
                        "run exceeded its {}s timeout",
                        self.dag.timeout().as_secs()
                    ),
                    Abort::Cancelled => "run cancelled".to_string(),
                },
            })
        });
        RunReport {
            context: self.ctx.clone(),
            status,
            reason,
            jobs: self.records,
            first_failure,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

type Finished = (usize, JobOutcome);

impl Scheduler {
    pub fn new(dispatcher: Arc<dyn JobDispatcher>, config: SchedulerConfig) -> Self {
        Self { dispatcher, config }
    }

    fn spawn_job(
        &self,
        set: &mut JoinSet<Finished>,
        state: &mut RunState<'_>,
        pos: usize,
        job_cancel: &watch::Receiver<bool>,
    ) {
        let job = state.order[pos].clone();
        let record = &mut state.records[pos];
        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
        info!(run_id = %state.ctx.run_id, job = %job.name, "Job dispatched");

        let ctx = JobContext {
            run: state.ctx.clone(),
            upstream: state.dag.ancestors(job.name.as_str()),
            cancel: job_cancel.clone(),
        };
        let dispatcher = self.dispatcher.clone();
        set.spawn(async move {
            let outcome = AssertUnwindSafe(dispatcher.dispatch(job, ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| JobOutcome::failed(FailureReason::Internal, "job runner panicked"));
            (pos, outcome)
        });
    }

    /// Execute one run of `dag` to completion.
    pub async fn execute(
        &self,
        dag: &WorkflowDag,
        ctx: RunContext,
        mut cancel: watch::Receiver<bool>,
    ) -> RunReport {
        let started_at = Utc::now();
        let deadline = tokio::time::Instant::now() + dag.timeout();
        let (job_cancel_tx, job_cancel_rx) = watch::channel(false);
        let mut state = RunState::new(dag, &ctx);
        let mut set: JoinSet<Finished> = JoinSet::new();
        let mut abort: Option<Abort> = None;
        let mut queued: Vec<usize> = vec![];
        let limit = self.config.max_parallel_jobs.unwrap_or(usize::MAX).max(1);

        info!(run_id = %ctx.run_id, workflow = %ctx.workflow, jobs = dag.len(), "Run started");

        loop {
            if abort.is_none() {
                for pos in state.ready() {
                    if !queued.contains(&pos) {
                        queued.push(pos);
                    }
                }
                queued.sort_unstable();
                while set.len() < limit && !queued.is_empty() {
                    let pos = queued.remove(0);
                    self.spawn_job(&mut set, &mut state, pos, &job_cancel_rx);
                }
            }

            if set.is_empty() {
                break;
            }

            tokio::select! {
                joined = set.join_next() => {
                    if let Some(Ok((pos, outcome))) = joined {
                        state.complete(pos, outcome, abort);
                    } else if let Some(Err(e)) = joined {
                        error!(run_id = %ctx.run_id, error = %e, "Job task failed");
                    }
                }
                _ = tokio::time::sleep_until(deadline), if abort.is_none() => {
                    warn!(run_id = %ctx.run_id, timeout_secs = dag.timeout().as_secs(), "Run timed out");
                    abort = Some(Abort::Timeout);
                }
                _ = ports::cancelled(&mut cancel), if abort.is_none() => {
                    warn!(run_id = %ctx.run_id, "Run cancelled");
                    abort = Some(Abort::Cancelled);
                }
            }

            if let Some(reason) = abort {
                if !*job_cancel_tx.borrow() {
                    job_cancel_tx.send_replace(true);
                    queued.clear();
                    state.abort_pending(reason);
                    self.wind_down(&mut set, &mut state, reason).await;
                }
            }
        }

        let report = state.into_report(started_at, abort);
        match report.status {
            RunStatus::Succeeded => info!(
                run_id = %ctx.run_id,
                workflow = %ctx.workflow,
                duration_ms = report.duration_ms(),
                "Run succeeded"
            ),
            status => warn!(
                run_id = %ctx.run_id,
                workflow = %ctx.workflow,
                status = status.as_str(),
                duration_ms = report.duration_ms(),
                "Run finished without success"
            ),
        }
        report
    }

    /// Collect running jobs after an abort, dropping the stragglers once the
    /// grace period expires.
    async fn wind_down(&self, set: &mut JoinSet<Finished>, state: &mut RunState<'_>, abort: Abort) {
        let grace = Duration::from_secs(self.config.cancel_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = set.join_next().await {
                if let Ok((pos, outcome)) = joined {
                    state.complete(pos, outcome, Some(abort));
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(run_id = %state.ctx.run_id, "Jobs ignored cancellation, dropping them");
            set.abort_all();
            while set.join_next().await.is_some() {}
        }

        for pos in 0..state.records.len() {
            if state.records[pos].status == JobStatus::Running {
                state.fail(pos, abort.reason(), "job torn down after the run was aborted".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagBuilder;
    use async_trait::async_trait;
    use kiln_core::run::TriggerInfo;

    struct Scripted {
        failing: Vec<&'static str>,
    }

    #[async_trait]
    impl JobDispatcher for Scripted {
        async fn dispatch(&self, job: Arc<Job>, _ctx: JobContext) -> JobOutcome {
            if self.failing.contains(&job.name.as_str()) {
                JobOutcome::failed(FailureReason::StepFailure, "exit 1")
            } else {
                JobOutcome::succeeded(vec![], vec![], 1)
            }
        }
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let dag = DagBuilder::new()
            .build_jobs(
                "ci",
                vec![
                    Job::new("a", &[], &["true"]),
                    Job::new("b", &["a"], &["true"]),
                    Job::new("c", &["b"], &["true"]),
                    Job::new("x", &[], &["true"]),
                ],
            )
            .unwrap();
        let scheduler = Scheduler::new(
            Arc::new(Scripted { failing: vec!["a"] }),
            SchedulerConfig::default(),
        );
        let (_tx, rx) = watch::channel(false);

        let report = scheduler
            .execute(&dag, RunContext::new("ci", TriggerInfo::push("main", None)), rx)
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.job_status("a"), Some(JobStatus::Failed));
        assert_eq!(report.job_status("b"), Some(JobStatus::Skipped));
        assert_eq!(report.job_status("c"), Some(JobStatus::Skipped));
        assert_eq!(report.job_status("x"), Some(JobStatus::Succeeded));
        assert_eq!(
            report.job("c").and_then(|r| r.skip.clone()),
            Some(SkipReason::DependencyFailed {
                dependency: kiln_core::JobName::new("b")
            })
        );
        assert_eq!(
            report.first_failure.as_ref().and_then(|f| f.job.clone()),
            Some(kiln_core::JobName::new("a"))
        );
    }
}

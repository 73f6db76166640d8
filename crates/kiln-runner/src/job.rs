//! Job runner: drives one job inside an acquired executor context.
//!
//! Order of work for a job:
//!
//! 1. acquire a context from the pool
//! 2. attach upstream workspace snapshots
//! 3. restore caches
//! 4. run steps in order, stopping at the first failure
//! 5. on success, save caches and persist the workspace
//!
//! The job's wall-clock ceiling and run cancellation both tear the context
//! down; the context is released on every path.

use crate::pool::ExecutorPool;
use async_trait::async_trait;
use chrono::Utc;
use kiln_cache::{CacheKeyResolver, KeyContext};
use kiln_core::job::{Job, Step};
use kiln_core::ports::{self, CommandSpec, ExecutionContext, JobContext, JobDispatcher, OutputLine, OutputStream, WorkspaceStore};
use kiln_core::run::{FailureReason, JobOutcome, StepOutcome};
use kiln_core::{JobName, SnapshotId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRunnerConfig {
    /// Lines of step output kept for the run report.
    pub output_tail_lines: usize,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            output_tail_lines: 200,
        }
    }
}

#[derive(Debug)]
struct JobFailure {
    reason: FailureReason,
    message: String,
}

impl JobFailure {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Step results and output collected while a job runs.
struct Progress {
    steps: Vec<StepOutcome>,
    tail: VecDeque<String>,
    capacity: usize,
}

impl Progress {
    fn new(capacity: usize) -> Self {
        Self {
            steps: vec![],
            tail: VecDeque::new(),
            capacity,
        }
    }

    fn record(&mut self, job: &JobName, step: &str, line: OutputLine) {
        match line.stream {
            OutputStream::Stdout => info!(target: "kiln::output", job = %job, step, "{}", line.content),
            OutputStream::Stderr => warn!(target: "kiln::output", job = %job, step, "{}", line.content),
        }
        if self.capacity == 0 {
            return;
        }
        if self.tail.len() == self.capacity {
            self.tail.pop_front();
        }
        self.tail.push_back(line.content);
    }

    fn into_parts(self) -> (Vec<StepOutcome>, Vec<String>) {
        (self.steps, self.tail.into_iter().collect())
    }
}

pub struct JobRunner {
    pool: Arc<ExecutorPool>,
    cache: CacheKeyResolver,
    workspaces: Arc<dyn WorkspaceStore>,
    config: JobRunnerConfig,
}

impl JobRunner {
    pub fn new(
        pool: Arc<ExecutorPool>,
        cache: CacheKeyResolver,
        workspaces: Arc<dyn WorkspaceStore>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            workspaces,
            config,
        }
    }

    /// Run a job to a terminal outcome.
    pub async fn run(&self, job: &Job, ctx: JobContext) -> JobOutcome {
        let start = Instant::now();
        let mut cancel = ctx.cancel.clone();
        let run_id = ctx.run.run_id;

        info!(run_id = %run_id, job = %job.name, environment = %job.environment_name, "Job started");

        let pooled = tokio::select! {
            acquired = self.pool.acquire(&job.environment_name, &job.environment) => match acquired {
                Ok(pooled) => pooled,
                Err(e) => {
                    error!(run_id = %run_id, job = %job.name, error = %e, "Executor unavailable");
                    return JobOutcome::failed(FailureReason::ExecutorUnavailable, e.to_string())
                        .with_duration(elapsed_ms(start));
                }
            },
            _ = ports::cancelled(&mut cancel) => {
                return JobOutcome::failed(FailureReason::Cancelled, "run cancelled before an executor was acquired")
                    .with_duration(elapsed_ms(start));
            }
        };

        let mut progress = Progress::new(self.config.output_tail_lines);
        let result = {
            let work = self.execute(job, &ctx, &pooled.context, &mut progress);
            tokio::select! {
                finished = tokio::time::timeout(job.timeout, work) => match finished {
                    Ok(result) => result,
                    Err(_) => Err(JobFailure::new(
                        FailureReason::Timeout,
                        format!("job exceeded its {}s timeout", job.timeout.as_secs()),
                    )),
                },
                _ = ports::cancelled(&mut cancel) => Err(JobFailure::new(FailureReason::Cancelled, "run cancelled")),
            }
        };

        if let Err(e) = self.pool.release(pooled).await {
            warn!(run_id = %run_id, job = %job.name, error = %e, "Failed to release executor");
        }

        let duration_ms = elapsed_ms(start);
        let (steps, output) = progress.into_parts();
        match result {
            Ok(()) => {
                info!(run_id = %run_id, job = %job.name, duration_ms, "Job succeeded");
                JobOutcome::succeeded(steps, output, duration_ms)
            }
            Err(failure) => {
                warn!(
                    run_id = %run_id,
                    job = %job.name,
                    reason = ?failure.reason,
                    message = %failure.message,
                    duration_ms,
                    "Job failed"
                );
                JobOutcome::failed(failure.reason, failure.message)
                    .with_steps(steps, output)
                    .with_duration(duration_ms)
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &JobContext,
        exec: &ExecutionContext,
        progress: &mut Progress,
    ) -> Result<(), JobFailure> {
        let env = job_env(job, ctx);

        self.attach(job, ctx, exec).await?;

        let key_ctx = KeyContext {
            arch: job.environment.arch.as_str().to_string(),
            platform: job.environment.platform.as_str().to_string(),
            job: job.name.to_string(),
            workflow: ctx.run.workflow.clone(),
            branch: ctx.run.trigger.branch.clone(),
            revision: ctx.run.trigger.revision.clone(),
            env: env.clone(),
            workdir: exec.workdir.clone(),
            epoch: Utc::now().timestamp(),
        };

        for directive in &job.cache.restore {
            if let Err(e) = self.cache.restore_into(&directive.keys, &key_ctx, &exec.workdir).await {
                soft_failure(job, "cache restore", directive.mandatory, &e)?;
            }
        }

        for step in &job.steps {
            self.run_step(job, exec, step, &env, progress).await?;
        }

        for directive in &job.cache.save {
            match self
                .cache
                .save_from(&directive.key, &key_ctx, &directive.paths, &exec.workdir)
                .await
            {
                Ok(Some(entry)) => debug!(job = %job.name, key = %entry.key, "Cache saved"),
                Ok(None) => {}
                Err(e) => soft_failure(job, "cache save", directive.mandatory, &e)?,
            }
        }

        if let Some(persist) = &job.workspace.persist {
            let root = exec.workdir.join(&persist.root);
            if let Err(e) = self
                .workspaces
                .persist(ctx.run.run_id, &job.name, &root, &persist.paths)
                .await
            {
                soft_failure(job, "workspace persist", persist.mandatory, &e)?;
            }
        }

        Ok(())
    }

    /// Materialize upstream snapshots into the sandbox.
    async fn attach(&self, job: &Job, ctx: &JobContext, exec: &ExecutionContext) -> Result<(), JobFailure> {
        let Some(attach) = &job.workspace.attach else {
            return Ok(());
        };

        let upstream: HashSet<&str> = ctx.upstream.iter().map(JobName::as_str).collect();
        for name in attach.from.iter().filter(|n| !upstream.contains(n.as_str())) {
            warn!(job = %job.name, from = %name, "Attach source is not upstream of this job, ignoring");
        }
        let sources: Vec<&JobName> = if attach.from.is_empty() {
            ctx.upstream.iter().collect()
        } else {
            ctx.upstream
                .iter()
                .filter(|u| attach.from.iter().any(|f| f == u.as_str()))
                .collect()
        };

        let snapshots = match self.workspaces.snapshots(ctx.run.run_id).await {
            Ok(snapshots) => snapshots,
            Err(e) => return soft_failure(job, "workspace attach", attach.mandatory, &e),
        };

        let mount = exec.workdir.join(&attach.at);
        let mut selected: Vec<SnapshotId> = vec![];
        for source in &sources {
            let owned: Vec<SnapshotId> = snapshots.iter().filter(|s| &s.job == *source).map(|s| s.id).collect();
            if owned.is_empty() && !attach.from.is_empty() {
                let e = kiln_core::Error::SnapshotNotFound(format!("no snapshot persisted by '{source}'"));
                soft_failure(job, "workspace attach", attach.mandatory, &e)?;
            }
            selected.extend(owned);
        }
        if selected.is_empty() && attach.mandatory {
            return Err(JobFailure::new(
                FailureReason::StepFailure,
                "workspace attach: no upstream snapshot available",
            ));
        }

        for snapshot_id in selected {
            if let Err(e) = self.workspaces.attach(ctx.run.run_id, snapshot_id, &mount).await {
                soft_failure(job, "workspace attach", attach.mandatory, &e)?;
            }
        }
        Ok(())
    }

    async fn run_step(
        &self,
        job: &Job,
        exec: &ExecutionContext,
        step: &Step,
        env: &HashMap<String, String>,
        progress: &mut Progress,
    ) -> Result<(), JobFailure> {
        let mut step_env = env.clone();
        step_env.extend(step.variables.clone());
        let spec = CommandSpec {
            script: step.command.clone(),
            shell: step.shell.clone(),
            working_directory: step.working_directory.clone(),
            env: step_env,
        };

        info!(job = %job.name, step = %step.name, "Step started");
        let start = Instant::now();
        let (tx, mut rx) = mpsc::channel::<OutputLine>(256);
        let executor = self.pool.executor().clone();
        let command = executor.run(exec, &spec, tx);
        let bounded = async {
            match step.timeout {
                Some(limit) => tokio::time::timeout(limit, command).await.ok(),
                None => Some(command.await),
            }
        };
        tokio::pin!(bounded);

        let finished = loop {
            tokio::select! {
                finished = &mut bounded => break finished,
                Some(line) = rx.recv() => progress.record(&job.name, &step.name, line),
            }
        };
        while let Ok(line) = rx.try_recv() {
            progress.record(&job.name, &step.name, line);
        }

        let duration_ms = elapsed_ms(start);
        match finished {
            None => {
                progress.steps.push(StepOutcome {
                    name: step.name.clone(),
                    exit_code: None,
                    duration_ms,
                });
                let secs = step.timeout.map(|t| t.as_secs()).unwrap_or_default();
                Err(JobFailure::new(
                    FailureReason::Timeout,
                    format!("step '{}' exceeded its {secs}s timeout", step.name),
                ))
            }
            Some(Err(e)) => {
                progress.steps.push(StepOutcome {
                    name: step.name.clone(),
                    exit_code: None,
                    duration_ms,
                });
                Err(JobFailure::new(
                    FailureReason::StepFailure,
                    format!("step '{}' could not run: {e}", step.name),
                ))
            }
            Some(Ok(result)) => {
                progress.steps.push(StepOutcome {
                    name: step.name.clone(),
                    exit_code: Some(result.exit_code),
                    duration_ms,
                });
                if result.success() {
                    debug!(job = %job.name, step = %step.name, duration_ms, "Step succeeded");
                    Ok(())
                } else {
                    Err(JobFailure::new(
                        FailureReason::StepFailure,
                        kiln_core::Error::StepFailed {
                            step: step.name.clone(),
                            exit_code: result.exit_code,
                        }
                        .to_string(),
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl JobDispatcher for JobRunner {
    async fn dispatch(&self, job: Arc<Job>, ctx: JobContext) -> JobOutcome {
        self.run(&job, ctx).await
    }
}

/// Store errors are tolerated unless the directive is mandatory.
fn soft_failure(job: &Job, what: &str, mandatory: bool, err: &kiln_core::Error) -> Result<(), JobFailure> {
    if mandatory {
        return Err(JobFailure::new(FailureReason::StepFailure, format!("{what}: {err}")));
    }
    warn!(job = %job.name, error = %err, "{what} failed, continuing without it");
    Ok(())
}

/// `KILN_*` variables, then job variables.
fn job_env(job: &Job, ctx: &JobContext) -> HashMap<String, String> {
    let mut env = HashMap::from([
        ("CI".to_string(), "true".to_string()),
        ("KILN".to_string(), "true".to_string()),
        ("KILN_RUN_ID".to_string(), ctx.run.run_id.to_string()),
        ("KILN_WORKFLOW".to_string(), ctx.run.workflow.clone()),
        ("KILN_JOB".to_string(), job.name.to_string()),
        ("KILN_BRANCH".to_string(), ctx.run.trigger.branch.clone()),
        (
            "KILN_REVISION".to_string(),
            ctx.run.trigger.revision.clone().unwrap_or_default(),
        ),
        ("KILN_PLATFORM".to_string(), job.environment.platform.as_str().to_string()),
        ("KILN_ARCH".to_string(), job.environment.arch.as_str().to_string()),
        ("KILN_TRIGGER".to_string(), ctx.run.trigger.trigger_type.as_str().to_string()),
    ]);
    env.extend(job.variables.clone());
    env
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::run::{RunContext, TriggerInfo};
    use tokio::sync::watch;

    #[test]
    fn test_job_env_step_precedence() {
        let mut job = Job::new("build", &[], &["true"]);
        job.variables.insert("KILN_BRANCH".to_string(), "override".to_string());
        let (_tx, rx) = watch::channel(false);
        let ctx = JobContext {
            run: RunContext::new("ci", TriggerInfo::push("main", Some("abc".to_string()))),
            upstream: vec![],
            cancel: rx,
        };

        let env = job_env(&job, &ctx);
        assert_eq!(env["KILN_JOB"], "build");
        assert_eq!(env["KILN_REVISION"], "abc");
        assert_eq!(env["KILN_BRANCH"], "override");
        assert_eq!(env["KILN_TRIGGER"], "push");
    }

    #[test]
    fn test_progress_keeps_bounded_tail() {
        let mut progress = Progress::new(2);
        let job = JobName::new("build");
        for n in 0..5 {
            progress.record(
                &job,
                "step",
                OutputLine {
                    stream: OutputStream::Stdout,
                    content: format!("line {n}"),
                    line_number: n,
                    timestamp: Utc::now(),
                },
            );
        }
        let (_, tail) = progress.into_parts();
        assert_eq!(tail, vec!["line 3".to_string(), "line 4".to_string()]);
    }
}

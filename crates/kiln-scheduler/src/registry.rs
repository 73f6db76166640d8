//! Process-wide orchestration state.
//!
//! The [`Orchestrator`] owns the loaded pipeline, the parsed cron schedules
//! with their next fire times, and every in-flight run. It is created once at
//! startup and torn down with [`Orchestrator::shutdown`].

use crate::dag::DagBuilder;
use crate::scheduler::Scheduler;
use crate::triggers::{CronSchedule, TriggerEvent, TriggerMatcher};
use chrono::{DateTime, Utc};
use kiln_core::ids::RunId;
use kiln_core::pipeline::{PipelineDefinition, TriggerType};
use kiln_core::ports::WorkspaceStore;
use kiln_core::run::{FailureReason, RunContext, RunReport, TriggerInfo};
use kiln_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Branch scheduled runs use when their trigger names no literal branch.
    pub default_branch: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
        }
    }
}

/// Summary of a run that is still executing.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub context: RunContext,
    pub started_at: DateTime<Utc>,
}

/// A started run. Dropping the handle leaves the run executing.
pub struct RunHandle {
    pub context: RunContext,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.context.run_id
    }

    /// Wait for the run to finish and return its report.
    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {e}")))
    }
}

/// A cron trigger of one workflow.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub workflow: String,
    pub schedule: CronSchedule,
    pub branches: Vec<String>,
    pub next_fire: Option<DateTime<Utc>>,
}

struct Tracked {
    info: ActiveRun,
    cancel: watch::Sender<bool>,
}

pub struct Orchestrator {
    pipeline: Arc<PipelineDefinition>,
    scheduler: Arc<Scheduler>,
    workspaces: Arc<dyn WorkspaceStore>,
    matcher: TriggerMatcher,
    dag_builder: DagBuilder,
    schedules: Mutex<Vec<ScheduleEntry>>,
    active: Arc<RwLock<HashMap<RunId, Tracked>>>,
    idle: Arc<Notify>,
    closed: AtomicBool,
}

impl Orchestrator {
    /// Load the pipeline's schedules and compute their first fire times.
    pub fn new(
        pipeline: Arc<PipelineDefinition>,
        scheduler: Arc<Scheduler>,
        workspaces: Arc<dyn WorkspaceStore>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let matcher = TriggerMatcher::new();
        let now = Utc::now();
        let mut schedules = vec![];
        for (name, workflow) in &pipeline.workflows {
            for trigger in &workflow.triggers {
                if trigger.trigger_type != TriggerType::Schedule {
                    continue;
                }
                let expression = trigger.cron.as_deref().ok_or_else(|| {
                    Error::InvalidPipeline(format!("workflow {name}: schedule trigger without cron"))
                })?;
                let schedule = CronSchedule::parse(expression)?;
                let next_fire = schedule.next_after(now);
                schedules.push(ScheduleEntry {
                    workflow: name.clone(),
                    branches: matcher.scheduled_branches(trigger, &config.default_branch),
                    schedule,
                    next_fire,
                });
            }
        }
        info!(
            workflows = pipeline.workflows.len(),
            schedules = schedules.len(),
            "Orchestrator initialized"
        );

        Ok(Self {
            pipeline,
            scheduler,
            workspaces,
            matcher,
            dag_builder: DagBuilder::new(),
            schedules: Mutex::new(schedules),
            active: Arc::new(RwLock::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    /// Start every run the event calls for.
    pub async fn handle(&self, event: TriggerEvent) -> Result<Vec<RunHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Internal("orchestrator is shut down".to_string()));
        }
        debug!(trigger = event.trigger_type().as_str(), "Handling trigger event");

        let mut handles = vec![];
        match event {
            TriggerEvent::Push { branch, revision } => {
                for (name, workflow) in &self.pipeline.workflows {
                    if self.matcher.push_matches(workflow, &branch) {
                        let trigger = TriggerInfo::push(branch.clone(), revision.clone());
                        handles.push(self.start(name, trigger).await?);
                    }
                }
                if handles.is_empty() {
                    info!(branch = %branch, "No workflow accepts the pushed branch");
                }
            }
            TriggerEvent::Tick { time, workflow } => {
                if let Some(name) = &workflow {
                    self.pipeline.workflow(name)?;
                }
                let fired: Vec<(String, Vec<String>)> = self
                    .schedules
                    .lock()
                    .await
                    .iter()
                    .filter(|s| workflow.as_ref().is_none_or(|w| *w == s.workflow))
                    .filter(|s| s.schedule.includes(time))
                    .map(|s| (s.workflow.clone(), s.branches.clone()))
                    .collect();
                for (name, branches) in fired {
                    for branch in branches {
                        let trigger = TriggerInfo::schedule(branch, time);
                        handles.push(self.start(&name, trigger).await?);
                    }
                }
            }
            TriggerEvent::Manual { workflow, branch } => {
                self.pipeline.workflow(&workflow)?;
                handles.push(self.start(&workflow, TriggerInfo::manual(branch)).await?);
            }
        }
        Ok(handles)
    }

    async fn start(&self, workflow: &str, trigger: TriggerInfo) -> Result<RunHandle> {
        let definition = self.pipeline.workflow(workflow)?;
        let context = RunContext::new(workflow, trigger);
        let dag = self.dag_builder.build(&self.pipeline, workflow, definition);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.active.write().await.insert(
            context.run_id,
            Tracked {
                info: ActiveRun {
                    context: context.clone(),
                    started_at: Utc::now(),
                },
                cancel: cancel_tx,
            },
        );
        info!(
            run_id = %context.run_id,
            workflow = %workflow,
            branch = %context.trigger.branch,
            trigger = context.trigger.trigger_type.as_str(),
            "Run created"
        );

        let scheduler = self.scheduler.clone();
        let workspaces = self.workspaces.clone();
        let active = self.active.clone();
        let idle = self.idle.clone();
        let ctx = context.clone();
        let task = tokio::spawn(async move {
            let report = match dag {
                Ok(dag) => scheduler.execute(&dag, ctx.clone(), cancel_rx).await,
                Err(e) => {
                    warn!(run_id = %ctx.run_id, error = %e, "Workflow graph is invalid");
                    RunReport::aborted(ctx.clone(), FailureReason::GraphError, e.to_string())
                }
            };
            if let Err(e) = workspaces.discard(ctx.run_id).await {
                warn!(run_id = %ctx.run_id, error = %e, "Failed to discard run workspace");
            }
            active.write().await.remove(&ctx.run_id);
            idle.notify_waiters();
            report
        });

        Ok(RunHandle { context, task })
    }

    /// Ask a run to stop. Returns false when the run is not active.
    pub async fn cancel(&self, run_id: RunId) -> bool {
        match self.active.read().await.get(&run_id) {
            Some(tracked) => {
                info!(run_id = %run_id, "Cancelling run");
                tracked.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub async fn active_runs(&self) -> Vec<ActiveRun> {
        let mut runs: Vec<ActiveRun> = self
            .active
            .read()
            .await
            .values()
            .map(|t| t.info.clone())
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    /// Cron triggers with their next fire times.
    pub async fn next_fire_times(&self) -> Vec<ScheduleEntry> {
        self.schedules.lock().await.clone()
    }

    /// Workflows whose next fire time is at or before `now`.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        self.schedules
            .lock()
            .await
            .iter()
            .filter_map(|s| s.next_fire.filter(|at| *at <= now).map(|at| (s.workflow.clone(), at)))
            .collect()
    }

    /// Start runs for every due schedule and advance their fire times.
    ///
    /// Fire times missed between two calls collapse into one run per branch.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<Vec<RunHandle>> {
        let fired: Vec<(String, Vec<String>, DateTime<Utc>)> = {
            let mut schedules = self.schedules.lock().await;
            schedules
                .iter_mut()
                .filter_map(|s| {
                    let at = s.next_fire.filter(|at| *at <= now)?;
                    s.next_fire = s.schedule.next_after(now);
                    Some((s.workflow.clone(), s.branches.clone(), at))
                })
                .collect()
        };

        let mut handles = vec![];
        for (workflow, branches, at) in fired {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            for branch in branches {
                match self.start(&workflow, TriggerInfo::schedule(branch.clone(), at)).await {
                    Ok(handle) => handles.push(handle),
                    // Runs already started must still reach the caller.
                    Err(e) => warn!(
                        workflow = %workflow,
                        branch = %branch,
                        error = %e,
                        "Scheduled run not started"
                    ),
                }
            }
        }
        Ok(handles)
    }

    /// Stop accepting events, cancel every active run and wait for all of
    /// them to finish.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let count = {
            let active = self.active.read().await;
            for tracked in active.values() {
                tracked.cancel.send_replace(true);
            }
            active.len()
        };
        info!(active_runs = count, "Shutting down orchestrator");

        loop {
            if self.active.read().await.is_empty() {
                break;
            }
            tokio::select! {
                _ = self.idle.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
        info!("Orchestrator stopped");
    }
}

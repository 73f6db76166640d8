//! Command handlers. Each returns the process exit code.

use crate::config::EngineConfig;
use crate::engine::{Engine, load_pipeline, open_cache};
use anyhow::Context;
use chrono::{DateTime, Utc};
use console::style;
use kiln_core::cache::CacheEntry;
use kiln_core::pipeline::{PipelineDefinition, TriggerType};
use kiln_core::ports::CacheStore;
use kiln_core::run::{JobRecord, JobStatus, RunReport, RunStatus, SkipReason};
use kiln_scheduler::dag::validate_pipeline;
use kiln_scheduler::{CronSchedule, Orchestrator, RunHandle, TriggerEvent};
use std::time::Duration;
use tracing::{info, warn};

/// Validate the pipeline and every workflow graph.
pub fn validate(config: &EngineConfig) -> anyhow::Result<i32> {
    let pipeline = load_pipeline(&config.pipeline)?;
    let mut exit_code = 0;

    for (name, result) in validate_pipeline(&pipeline) {
        match result {
            Ok(dag) => {
                let order: Vec<String> = dag
                    .topological_order()
                    .iter()
                    .map(|job| job.name.to_string())
                    .collect();
                println!(
                    "{} {} ({} jobs): {}",
                    style("✓").green(),
                    style(&name).bold(),
                    dag.len(),
                    order.join(" → ")
                );
            }
            Err(e) => {
                exit_code = 1;
                println!("{} {}: {} {}", style("✗").red(), style(&name).bold(), e.kind, e);
            }
        }
    }

    for (name, workflow) in &pipeline.workflows {
        for trigger in &workflow.triggers {
            if trigger.trigger_type != TriggerType::Schedule {
                continue;
            }
            let parsed = trigger
                .cron
                .as_deref()
                .context("schedule trigger without cron")
                .and_then(|expr| Ok(CronSchedule::parse(expr)?));
            if let Err(e) = parsed {
                exit_code = 1;
                println!("{} {}: {}", style("✗").red(), style(name).bold(), e);
            }
        }
    }

    if exit_code == 0 {
        println!(
            "{} {} is valid",
            style("✓").green(),
            config.pipeline.display()
        );
    }
    Ok(exit_code)
}

async fn engine(config: &EngineConfig) -> anyhow::Result<Engine> {
    let pipeline = load_pipeline(&config.pipeline)?;
    Engine::start(config.clone(), pipeline).await
}

/// Handle a push event and wait for the runs it starts.
pub async fn push(config: &EngineConfig, branch: String, commit: Option<String>) -> anyhow::Result<i32> {
    let engine = engine(config).await?;
    let handles = engine
        .orchestrator
        .handle(TriggerEvent::Push {
            branch: branch.clone(),
            revision: commit,
        })
        .await?;
    if handles.is_empty() {
        println!(
            "{} No workflow runs on branch {}",
            style("i").blue(),
            style(&branch).bold()
        );
        return Ok(0);
    }
    await_runs(&engine, handles).await
}

/// Handle a schedule tick.
pub async fn tick(config: &EngineConfig, workflow: Option<String>, time: Option<String>) -> anyhow::Result<i32> {
    let time = match time {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .with_context(|| format!("Invalid tick time {raw}"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let engine = engine(config).await?;
    let handles = engine
        .orchestrator
        .handle(TriggerEvent::Tick { time, workflow })
        .await?;
    if handles.is_empty() {
        println!("{} Nothing scheduled at {}", style("i").blue(), time.to_rfc3339());
        return Ok(0);
    }
    await_runs(&engine, handles).await
}

/// Run one workflow on demand.
pub async fn run_workflow(config: &EngineConfig, workflow: String, branch: Option<String>) -> anyhow::Result<i32> {
    let engine = engine(config).await?;
    let branch = branch.unwrap_or_else(|| config.default_branch.clone());
    let handles = engine
        .orchestrator
        .handle(TriggerEvent::Manual { workflow, branch })
        .await?;
    await_runs(&engine, handles).await
}

/// Wait for runs, cancelling them on Ctrl-C.
async fn await_runs(engine: &Engine, handles: Vec<RunHandle>) -> anyhow::Result<i32> {
    for handle in &handles {
        println!(
            "{} {} {} on {}",
            style("▶").cyan(),
            style(&handle.context.workflow).bold(),
            style(handle.run_id()).dim(),
            handle.context.trigger.branch
        );
    }

    let waiting = futures::future::join_all(handles.into_iter().map(RunHandle::wait));
    tokio::pin!(waiting);
    let results = tokio::select! {
        results = &mut waiting => results,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling runs");
            engine.orchestrator.shutdown().await;
            waiting.await
        }
    };

    let mut exit_code = 0;
    for result in results {
        let report = result?;
        print_report(&report);
        exit_code = exit_code.max(report.exit_code());
    }
    Ok(exit_code)
}

fn job_detail(record: &JobRecord) -> String {
    match (&record.status, &record.skip, &record.reason) {
        (JobStatus::Skipped, Some(SkipReason::DependencyFailed { dependency }), _) => {
            format!("requires {dependency}")
        }
        (JobStatus::Skipped, Some(SkipReason::BranchFiltered), _) => "branch filtered".to_string(),
        (JobStatus::Skipped, Some(SkipReason::RunAborted), _) => "run aborted".to_string(),
        (JobStatus::Failed, _, Some(reason)) => format!(
            "{:?}: {}",
            reason,
            record.message.as_deref().unwrap_or_default()
        ),
        _ => String::new(),
    }
}

fn format_duration(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

/// Per-job status table plus the first-failure diagnostic.
pub fn print_report(report: &RunReport) {
    let width = report
        .jobs
        .iter()
        .map(|j| j.name.as_str().len())
        .max()
        .unwrap_or(0);

    println!();
    println!(
        "{} {}",
        style(&report.context.workflow).bold(),
        style(report.context.run_id).dim()
    );
    for record in &report.jobs {
        let marker = match record.status {
            JobStatus::Succeeded => style("✓").green(),
            JobStatus::Failed => style("✗").red(),
            JobStatus::Skipped => style("-").yellow(),
            JobStatus::Pending | JobStatus::Running => style("?").dim(),
        };
        let duration = record.duration_ms().map(format_duration).unwrap_or_default();
        println!(
            "  {} {:<width$}  {:<9}  {:>7}  {}",
            marker,
            record.name.as_str(),
            record.status.as_str(),
            duration,
            style(job_detail(record)).dim(),
        );
    }

    let summary = format!(
        "Run {} in {}",
        report.status.as_str(),
        format_duration(report.duration_ms())
    );
    match report.status {
        RunStatus::Succeeded => println!("{} {}", style("✓").green(), summary),
        _ => println!("{} {}", style("✗").red(), style(summary).red()),
    }
    if let Some(failure) = &report.first_failure {
        let job = failure
            .job
            .as_ref()
            .map(|j| format!("{j}: "))
            .unwrap_or_default();
        println!(
            "  first failure: {}{:?}: {}",
            job, failure.reason, failure.message
        );
        if let Some(record) = failure.job.as_ref().and_then(|j| report.job(j.as_str())) {
            for line in record.output.iter().rev().take(10).rev() {
                println!("    {}", style(line).dim());
            }
        }
    }
}

/// Print cron schedules and their next fire times.
pub async fn schedule(config: &EngineConfig) -> anyhow::Result<i32> {
    let engine = engine(config).await?;
    let entries = engine.orchestrator.next_fire_times().await;
    if entries.is_empty() {
        println!("{} No scheduled workflows", style("i").blue());
        return Ok(0);
    }
    for entry in entries {
        let next = entry
            .next_fire
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{} {:<20} {:<16} {} [{}]",
            style("⏲").cyan(),
            style(&entry.workflow).bold(),
            entry.schedule.expression(),
            next,
            entry.branches.join(", ")
        );
    }
    Ok(0)
}

/// Start every due scheduled run. Failures are logged so the daemon keeps ticking.
async fn fire_scheduled(orchestrator: &Orchestrator, now: DateTime<Utc>) -> usize {
    let handles = match orchestrator.fire_due(now).await {
        Ok(handles) => handles,
        Err(e) => {
            warn!(error = %e, "Failed to fire due schedules");
            return 0;
        }
    };
    let started = handles.len();
    for handle in handles {
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(report) => info!(
                    run_id = %report.context.run_id,
                    workflow = %report.context.workflow,
                    status = report.status.as_str(),
                    "Scheduled run finished"
                ),
                Err(e) => warn!(error = %e, "Scheduled run failed"),
            }
        });
    }
    started
}

/// Fire due schedules until Ctrl-C, then shut down gracefully.
pub async fn daemon(config: &EngineConfig) -> anyhow::Result<i32> {
    let engine = engine(config).await?;
    let mut interval = tokio::time::interval(Duration::from_secs(config.tick_interval_secs.max(1)));
    info!(
        tick_interval_secs = config.tick_interval_secs,
        pipeline = %config.pipeline.display(),
        "Daemon started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                fire_scheduled(&engine.orchestrator, Utc::now()).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    engine.orchestrator.shutdown().await;
    Ok(0)
}

fn print_entries(entries: &[CacheEntry]) {
    for entry in entries {
        println!(
            "  {}  {:>10}  {}  {}",
            style(entry.storage_key()).bold(),
            format_bytes(entry.size_bytes),
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            style(format!("{} hits", entry.access_count)).dim()
        );
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// List cache entries.
pub async fn list_cache(config: &EngineConfig, prefix: Option<String>) -> anyhow::Result<i32> {
    let store = open_cache(config).await?;
    let entries = store.list(prefix.as_deref()).await?;
    if entries.is_empty() {
        println!("{} No cache entries", style("i").blue());
        return Ok(0);
    }
    print_entries(&entries);
    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    println!("{} entries, {}", entries.len(), format_bytes(total));
    Ok(0)
}

/// Apply the retention policy.
pub async fn prune_cache(config: &EngineConfig) -> anyhow::Result<i32> {
    let store = open_cache(config).await?;
    let evicted = store.prune().await?;
    print_entries(&evicted);
    println!(
        "{} Evicted {} entries",
        style("✓").green(),
        evicted.len()
    );
    Ok(0)
}

/// Print the pipeline JSON schema.
pub fn schema() -> anyhow::Result<i32> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(0)
}

/// Show the effective configuration.
pub fn show_config(config: &EngineConfig) -> anyhow::Result<i32> {
    print!("{}", serde_yaml::to_string(config)?);
    if let Some(path) = EngineConfig::default_path() {
        println!("\n# Config file: {}", path.display());
    }
    Ok(0)
}

//! Resolved, immutable job instances.
//!
//! A [`Job`] is what the scheduler and runner operate on: a workflow entry
//! combined with its job definition and executor descriptor.

use crate::filter::BranchFilter;
use crate::ids::JobName;
use crate::pipeline::{
    CacheDirectives, EnvironmentDescriptor, ExecutorRef, JobDefinition, PipelineDefinition,
    StepSpec, WorkflowJob, WorkspaceDirectives,
};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Job {
    pub name: JobName,
    /// Name of the job definition this instance was created from.
    pub definition: String,
    /// Executor name used for pool capacity; inline descriptors use the job definition name.
    pub environment_name: String,
    pub environment: EnvironmentDescriptor,
    pub steps: Vec<Step>,
    pub variables: HashMap<String, String>,
    pub requires: Vec<JobName>,
    pub branches: Option<BranchFilter>,
    pub cache: CacheDirectives,
    pub workspace: WorkspaceDirectives,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub command: String,
    pub shell: String,
    pub working_directory: Option<String>,
    pub variables: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl Step {
    pub fn shell(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            name: step_label(&command),
            command,
            shell: "sh".to_string(),
            working_directory: None,
            variables: HashMap::new(),
            timeout: None,
        }
    }
}

fn step_label(command: &str) -> String {
    let first = command.lines().next().unwrap_or_default().trim();
    if first.chars().count() > 48 {
        let truncated: String = first.chars().take(45).collect();
        format!("{truncated}...")
    } else {
        first.to_string()
    }
}

impl From<&StepSpec> for Step {
    fn from(spec: &StepSpec) -> Self {
        match spec {
            StepSpec::Command(command) => Step::shell(command.clone()),
            StepSpec::Detailed(def) => Step {
                name: def.name.clone().unwrap_or_else(|| step_label(&def.run)),
                command: def.run.clone(),
                shell: def.shell.clone(),
                working_directory: def.working_directory.clone(),
                variables: def.variables.clone(),
                timeout: def
                    .timeout_minutes
                    .map(|m| Duration::from_secs(u64::from(m) * 60)),
            },
        }
    }
}

/// Why a job could not be resolved from its workflow entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    UnknownJob(String),
    UnknownExecutor(String),
}

impl Job {
    /// Resolve a workflow entry against the pipeline's job and executor tables.
    pub fn resolve(
        pipeline: &PipelineDefinition,
        entry: &WorkflowJob,
    ) -> std::result::Result<Self, ResolveError> {
        let definition = pipeline
            .jobs
            .get(&entry.job)
            .ok_or_else(|| ResolveError::UnknownJob(entry.job.clone()))?;
        let (environment_name, environment) = match &definition.executor {
            ExecutorRef::Named(name) => {
                let descriptor = pipeline
                    .executors
                    .get(name)
                    .ok_or_else(|| ResolveError::UnknownExecutor(name.clone()))?;
                (name.clone(), descriptor.clone())
            }
            ExecutorRef::Inline(descriptor) => (entry.job.clone(), descriptor.clone()),
        };
        Ok(Self::from_definition(
            entry,
            definition,
            environment_name,
            environment,
        ))
    }

    fn from_definition(
        entry: &WorkflowJob,
        definition: &JobDefinition,
        environment_name: String,
        environment: EnvironmentDescriptor,
    ) -> Self {
        Self {
            name: JobName::new(entry.instance_name()),
            definition: entry.job.clone(),
            environment_name,
            environment,
            steps: definition.steps.iter().map(Step::from).collect(),
            variables: definition.variables.clone(),
            requires: entry.requires.iter().map(|r| JobName::new(r.as_str())).collect(),
            branches: entry.branches.clone(),
            cache: definition.cache.clone(),
            workspace: definition.workspace.clone(),
            timeout: Duration::from_secs(u64::from(definition.timeout_minutes) * 60),
        }
    }

    /// Minimal job with shell steps; used by tests and ad-hoc runs.
    pub fn new(name: &str, requires: &[&str], commands: &[&str]) -> Self {
        Self {
            name: JobName::new(name),
            definition: name.to_string(),
            environment_name: "default".to_string(),
            environment: EnvironmentDescriptor::default(),
            steps: commands.iter().map(|c| Step::shell(*c)).collect(),
            variables: HashMap::new(),
            requires: requires.iter().map(|r| JobName::new(*r)).collect(),
            branches: None,
            cache: CacheDirectives::default(),
            workspace: WorkspaceDirectives::default(),
            timeout: Duration::from_secs(3600),
        }
    }

    /// Whether this job's own branch filter lets it run on `branch`.
    pub fn accepts_branch(&self, branch: &str) -> bool {
        self.branches.as_ref().is_none_or(|f| f.matches(branch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Arch, Platform};

    fn pipeline() -> PipelineDefinition {
        PipelineDefinition::from_yaml(
            r#"
executors:
  arm64: { platform: linux, arch: aarch64 }
jobs:
  build:
    executor: arm64
    timeout_minutes: 2
    steps:
      - cargo build
      - name: test
        run: cargo test
        variables: { RUST_BACKTRACE: "1" }
  broken:
    executor: missing
    steps: ["true"]
workflows:
  ci:
    jobs:
      - job: build
        name: build-arm
        branches: { only: [main] }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_job() {
        let def = pipeline();
        let entry = &def.workflows["ci"].jobs[0];
        let job = Job::resolve(&def, entry).unwrap();

        assert_eq!(job.name.as_str(), "build-arm");
        assert_eq!(job.definition, "build");
        assert_eq!(job.environment_name, "arm64");
        assert_eq!(job.environment.arch, Arch::Aarch64);
        assert_eq!(job.environment.platform, Platform::Linux);
        assert_eq!(job.timeout, Duration::from_secs(120));
        assert_eq!(job.steps.len(), 2);
        assert_eq!(job.steps[0].name, "cargo build");
        assert_eq!(job.steps[1].name, "test");
        assert_eq!(job.steps[1].variables["RUST_BACKTRACE"], "1");
        assert!(job.accepts_branch("main"));
        assert!(!job.accepts_branch("dev"));
    }

    #[test]
    fn test_resolve_unknown_references() {
        let def = pipeline();
        let unknown_job = WorkflowJob {
            job: "nope".to_string(),
            name: None,
            requires: vec![],
            branches: None,
        };
        assert_eq!(
            Job::resolve(&def, &unknown_job).unwrap_err(),
            ResolveError::UnknownJob("nope".to_string())
        );

        let bad_executor = WorkflowJob {
            job: "broken".to_string(),
            ..unknown_job
        };
        assert_eq!(
            Job::resolve(&def, &bad_executor).unwrap_err(),
            ResolveError::UnknownExecutor("missing".to_string())
        );
    }

    #[test]
    fn test_long_commands_get_short_labels() {
        let step = Step::shell("echo 0123456789012345678901234567890123456789012345678901234567890\necho done");
        assert!(step.name.ends_with("..."));
        assert_eq!(step.name.chars().count(), 48);
    }
}

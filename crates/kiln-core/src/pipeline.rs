//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.

use crate::filter::BranchFilter;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub executors: BTreeMap<String, EnvironmentDescriptor>,
    pub jobs: BTreeMap<String, JobDefinition>,
    pub workflows: BTreeMap<String, WorkflowDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    /// Parse a pipeline definition from YAML (JSON is accepted too).
    pub fn from_yaml(source: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(source)?;
        definition.validate_filters()?;
        Ok(definition)
    }

    /// Load a pipeline definition from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn workflow(&self, name: &str) -> Result<&WorkflowDefinition> {
        self.workflows
            .get(name)
            .ok_or_else(|| Error::WorkflowNotFound(name.to_string()))
    }

    fn validate_filters(&self) -> Result<()> {
        for (name, workflow) in &self.workflows {
            let filters = workflow
                .triggers
                .iter()
                .map(|t| &t.branches)
                .chain(workflow.jobs.iter().filter_map(|j| j.branches.as_ref()));
            for filter in filters {
                filter
                    .validate()
                    .map_err(|e| Error::InvalidPipeline(format!("workflow {name}: {e}")))?;
            }
        }
        Ok(())
    }
}

/// Description of the machine a job needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentDescriptor {
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub arch: Arch,
    #[serde(default)]
    pub resource_class: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl Default for EnvironmentDescriptor {
    fn default() -> Self {
        Self {
            platform: Platform::Linux,
            arch: Arch::X86_64,
            resource_class: None,
            image: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Linux,
    Macos,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Macos => "macos",
        }
    }

    /// Platform of the running process.
    pub fn host() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(target_os = "macos") {
            Some(Platform::Macos)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    #[default]
    #[serde(alias = "amd64")]
    X86_64,
    #[serde(alias = "arm64")]
    Aarch64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }

    /// Architecture of the running process.
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else {
            None
        }
    }
}

/// Reference to an executor: by name or declared inline.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ExecutorRef {
    Named(String),
    Inline(EnvironmentDescriptor),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub executor: ExecutorRef,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub cache: CacheDirectives,
    #[serde(default)]
    pub workspace: WorkspaceDirectives,
    #[serde(default = "default_job_timeout")]
    pub timeout_minutes: u32,
}

fn default_job_timeout() -> u32 {
    60
}

/// A step is either a bare shell command or a structured step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StepSpec {
    Command(String),
    Detailed(StepDefinition),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub run: String,
    /// Interpreter for `run`: a bare shell name (`bash`), or a program with
    /// the arguments that precede the script (`pwsh -NoProfile -Command`).
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

fn default_shell() -> String {
    "sh".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CacheDirectives {
    #[serde(default)]
    pub restore: Vec<RestoreCacheDirective>,
    #[serde(default)]
    pub save: Vec<SaveCacheDirective>,
}

impl CacheDirectives {
    pub fn is_empty(&self) -> bool {
        self.restore.is_empty() && self.save.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RestoreCacheDirective {
    /// Key templates tried in order; the first hit wins.
    pub keys: Vec<String>,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SaveCacheDirective {
    pub key: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WorkspaceDirectives {
    #[serde(default)]
    pub attach: Option<AttachDirective>,
    #[serde(default)]
    pub persist: Option<PersistDirective>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttachDirective {
    /// Directory, relative to the sandbox, the snapshots are materialized into.
    #[serde(default = "default_root")]
    pub at: String,
    /// Upstream jobs whose snapshots to attach; all upstream snapshots when empty.
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PersistDirective {
    #[serde(default = "default_root")]
    pub root: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub mandatory: bool,
}

fn default_root() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    pub jobs: Vec<WorkflowJob>,
    #[serde(default = "default_workflow_timeout")]
    pub timeout_minutes: u32,
}

fn default_workflow_timeout() -> u32 {
    120
}

/// One job instance inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowJob {
    /// Name of the job definition.
    pub job: String,
    /// Instance name, defaults to the job definition name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub branches: Option<BranchFilter>,
}

impl WorkflowJob {
    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.job)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub branches: BranchFilter,
    #[serde(default)]
    pub cron: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    Schedule,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Push => "push",
            TriggerType::Schedule => "schedule",
            TriggerType::Manual => "manual",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
version: "1"
executors:
  linux-xlarge: { platform: linux, arch: x86_64, resource_class: xlarge }
  darwin: { platform: macos, arch: arm64 }
jobs:
  fetch:
    executor: linux-xlarge
    steps:
      - cargo fetch
      - name: versions
        run: rustc --version
        timeout_minutes: 5
    cache:
      restore:
        - keys: ['v1-cargo-{{ arch }}-{{ checksum "Cargo.lock" }}']
    workspace:
      persist: { paths: [.] }
  mac:
    executor: { platform: macos, arch: aarch64 }
    steps: [cargo test]
    workspace:
      attach: {}
workflows:
  test:
    triggers:
      - type: push
        branches: { ignore: [gh-pages] }
    jobs:
      - job: fetch
      - job: mac
        requires: [fetch]
"#;

    #[test]
    fn test_parse_pipeline() {
        let def = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        assert_eq!(def.jobs.len(), 2);
        assert_eq!(def.executors["darwin"].arch, Arch::Aarch64);

        let fetch = &def.jobs["fetch"];
        assert_eq!(fetch.timeout_minutes, 60);
        assert!(matches!(fetch.steps[0], StepSpec::Command(ref c) if c == "cargo fetch"));
        assert!(matches!(
            fetch.steps[1],
            StepSpec::Detailed(ref s) if s.timeout_minutes == Some(5) && s.shell == "sh"
        ));
        assert_eq!(fetch.workspace.persist.as_ref().unwrap().root, ".");

        let mac = &def.jobs["mac"];
        assert!(matches!(mac.executor, ExecutorRef::Inline(ref d) if d.platform == Platform::Macos));
        assert_eq!(mac.workspace.attach.as_ref().unwrap().at, ".");

        let wf = def.workflow("test").unwrap();
        assert_eq!(wf.timeout_minutes, 120);
        assert_eq!(wf.triggers[0].trigger_type, TriggerType::Push);
        assert!(!wf.triggers[0].branches.matches("gh-pages"));
        assert_eq!(wf.jobs[1].requires, vec!["fetch".to_string()]);
    }

    #[test]
    fn test_unknown_workflow() {
        let def = PipelineDefinition::from_yaml(PIPELINE).unwrap();
        assert!(matches!(def.workflow("nope"), Err(Error::WorkflowNotFound(_))));
    }

    #[test]
    fn test_bad_branch_regex_is_rejected() {
        let source = PIPELINE.replace("ignore: [gh-pages]", "ignore: ['/(oops/']");
        assert!(matches!(
            PipelineDefinition::from_yaml(&source),
            Err(Error::InvalidPipeline(_))
        ));
    }
}

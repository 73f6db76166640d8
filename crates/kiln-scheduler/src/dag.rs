//! Job dependency graphs for workflows.

use kiln_core::JobName;
use kiln_core::job::{Job, ResolveError};
use kiln_core::pipeline::{PipelineDefinition, WorkflowDefinition};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(120 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphErrorKind {
    UnknownDependency,
    Cycle,
    DuplicateName,
    UnknownJob,
    UnknownExecutor,
    EmptyWorkflow,
}

impl GraphErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphErrorKind::UnknownDependency => "unknown_dependency",
            GraphErrorKind::Cycle => "cycle",
            GraphErrorKind::DuplicateName => "duplicate_name",
            GraphErrorKind::UnknownJob => "unknown_job",
            GraphErrorKind::UnknownExecutor => "unknown_executor",
            GraphErrorKind::EmptyWorkflow => "empty_workflow",
        }
    }
}

/// Static graph failure; the run is aborted before any executor is acquired.
///
/// `names` holds the offending names. For cycles it is the cycle path with
/// the first job repeated at the end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", describe(.kind, .names))]
pub struct GraphError {
    pub kind: GraphErrorKind,
    pub names: Vec<String>,
}

impl GraphError {
    pub fn new(kind: GraphErrorKind, names: Vec<String>) -> Self {
        Self { kind, names }
    }
}

fn describe(kind: &GraphErrorKind, names: &[String]) -> String {
    let first = names.first().map(String::as_str).unwrap_or_default();
    let second = names.get(1).map(String::as_str).unwrap_or_default();
    match kind {
        GraphErrorKind::UnknownDependency => {
            format!("job '{first}' requires unknown job '{second}'")
        }
        GraphErrorKind::Cycle => format!("dependency cycle: {}", names.join(" -> ")),
        GraphErrorKind::DuplicateName => format!("duplicate job name '{first}'"),
        GraphErrorKind::UnknownJob => format!("workflow references undeclared job '{first}'"),
        GraphErrorKind::UnknownExecutor => {
            format!("job '{first}' uses undeclared executor '{second}'")
        }
        GraphErrorKind::EmptyWorkflow => format!("workflow '{first}' has no jobs"),
    }
}

impl fmt::Display for GraphErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, acyclic job graph of one workflow. Edges point from a
/// dependency to the job that requires it.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    workflow: String,
    graph: DiGraph<Arc<Job>, ()>,
    index: HashMap<JobName, NodeIndex>,
    order: Vec<NodeIndex>,
    timeout: Duration,
}

impl WorkflowDag {
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Run-wide ceiling.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Job>> {
        self.index
            .get(name)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    /// Jobs in declaration order.
    pub fn jobs(&self) -> Vec<&Arc<Job>> {
        self.graph
            .node_indices()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Jobs without dependencies.
    pub fn roots(&self) -> Vec<&Arc<Job>> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Jobs that directly require `name`.
    pub fn successors(&self, name: &str) -> Vec<&Arc<Job>> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Jobs `name` directly requires.
    pub fn predecessors(&self, name: &str) -> Vec<&Arc<Job>> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&Arc<Job>> {
        let Some(&idx) = self.index.get(name) else {
            return vec![];
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        found.sort();
        found
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n))
            .collect()
    }

    /// Jobs ordered so every job comes after everything it requires.
    /// Ties are broken by declaration order.
    pub fn topological_order(&self) -> Vec<&Arc<Job>> {
        self.order
            .iter()
            .filter_map(|&idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Transitive dependencies of `name`, in topological order.
    pub fn ancestors(&self, name: &str) -> Vec<JobName> {
        let Some(&start) = self.index.get(name) else {
            return vec![];
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut seen = BTreeSet::new();
        while let Some(idx) = dfs.next(reversed) {
            if idx != start {
                seen.insert(idx);
            }
        }
        self.order
            .iter()
            .filter(|idx| seen.contains(*idx))
            .filter_map(|&idx| self.graph.node_weight(idx))
            .map(|job| job.name.clone())
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search over `requires` edges with an explicit stack.
/// Returns the first cycle found as a path of node positions.
fn find_cycle(requires: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; requires.len()];
    for start in 0..requires.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // (node, next child to visit)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::OnStack;
        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let Some(&child) = requires[node].get(frame.1) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            frame.1 += 1;
            match marks[child] {
                Mark::OnStack => {
                    let from = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                    let mut cycle: Vec<usize> = stack[from..].iter().map(|(n, _)| *n).collect();
                    cycle.push(child);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[child] = Mark::OnStack;
                    stack.push((child, 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}

/// Builder for workflow graphs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a workflow's entries against the pipeline and build its graph.
    pub fn build(
        &self,
        pipeline: &PipelineDefinition,
        workflow_name: &str,
        workflow: &WorkflowDefinition,
    ) -> Result<WorkflowDag, GraphError> {
        if workflow.jobs.is_empty() {
            return Err(GraphError::new(
                GraphErrorKind::EmptyWorkflow,
                vec![workflow_name.to_string()],
            ));
        }

        let mut jobs = Vec::with_capacity(workflow.jobs.len());
        for entry in &workflow.jobs {
            let job = Job::resolve(pipeline, entry).map_err(|e| match e {
                ResolveError::UnknownJob(name) => {
                    GraphError::new(GraphErrorKind::UnknownJob, vec![name])
                }
                ResolveError::UnknownExecutor(executor) => GraphError::new(
                    GraphErrorKind::UnknownExecutor,
                    vec![entry.job.clone(), executor],
                ),
            })?;
            jobs.push(job);
        }

        Ok(self
            .build_jobs(workflow_name, jobs)?
            .with_timeout(Duration::from_secs(u64::from(workflow.timeout_minutes) * 60)))
    }

    /// Build a graph from already-resolved jobs.
    pub fn build_jobs(&self, workflow_name: &str, jobs: Vec<Job>) -> Result<WorkflowDag, GraphError> {
        if jobs.is_empty() {
            return Err(GraphError::new(
                GraphErrorKind::EmptyWorkflow,
                vec![workflow_name.to_string()],
            ));
        }

        let mut positions: HashMap<JobName, usize> = HashMap::new();
        for (pos, job) in jobs.iter().enumerate() {
            if positions.insert(job.name.clone(), pos).is_some() {
                return Err(GraphError::new(
                    GraphErrorKind::DuplicateName,
                    vec![job.name.to_string()],
                ));
            }
        }

        let mut requires: Vec<Vec<usize>> = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let mut deps = Vec::with_capacity(job.requires.len());
            for dep in &job.requires {
                let pos = positions.get(dep).ok_or_else(|| {
                    GraphError::new(
                        GraphErrorKind::UnknownDependency,
                        vec![job.name.to_string(), dep.to_string()],
                    )
                })?;
                deps.push(*pos);
            }
            requires.push(deps);
        }

        if let Some(cycle) = find_cycle(&requires) {
            return Err(GraphError::new(
                GraphErrorKind::Cycle,
                cycle.iter().map(|&pos| jobs[pos].name.to_string()).collect(),
            ));
        }

        let mut graph = DiGraph::with_capacity(jobs.len(), requires.iter().map(Vec::len).sum());
        let mut index = HashMap::new();
        let nodes: Vec<NodeIndex> = jobs
            .into_iter()
            .map(|job| {
                let name = job.name.clone();
                let idx = graph.add_node(Arc::new(job));
                index.insert(name, idx);
                idx
            })
            .collect();
        for (pos, deps) in requires.iter().enumerate() {
            for &dep in deps {
                graph.update_edge(nodes[dep], nodes[pos], ());
            }
        }

        let order = stable_topological_order(&graph);
        Ok(WorkflowDag {
            workflow: workflow_name.to_string(),
            graph,
            index,
            order,
            timeout: DEFAULT_RUN_TIMEOUT,
        })
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Kahn's algorithm, always taking the earliest-declared ready node.
fn stable_topological_order(graph: &DiGraph<Arc<Job>, ()>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<NodeIndex> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .collect();
    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.insert(next);
            }
        }
    }
    order
}

/// Build every workflow of a pipeline, reporting each result by name.
pub fn validate_pipeline(pipeline: &PipelineDefinition) -> Vec<(String, Result<WorkflowDag, GraphError>)> {
    let builder = DagBuilder::new();
    pipeline
        .workflows
        .iter()
        .map(|(name, workflow)| (name.clone(), builder.build(pipeline, name, workflow)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(jobs: Vec<&Arc<Job>>) -> Vec<&str> {
        jobs.into_iter().map(|j| j.name.as_str()).collect()
    }

    fn build(jobs: Vec<Job>) -> Result<WorkflowDag, GraphError> {
        DagBuilder::new().build_jobs("test", jobs)
    }

    #[test]
    fn test_diamond_dag() {
        let dag = build(vec![
            Job::new("release", &["linux", "mac"], &["true"]),
            Job::new("fetch", &[], &["true"]),
            Job::new("linux", &["fetch"], &["true"]),
            Job::new("mac", &["fetch"], &["true"]),
        ])
        .unwrap();

        assert_eq!(names(dag.roots()), vec!["fetch"]);
        assert_eq!(names(dag.successors("fetch")), vec!["linux", "mac"]);
        assert_eq!(names(dag.predecessors("release")), vec!["linux", "mac"]);
        assert_eq!(
            names(dag.topological_order()),
            vec!["fetch", "linux", "mac", "release"]
        );
        assert_eq!(
            dag.ancestors("release"),
            vec![JobName::new("fetch"), JobName::new("linux"), JobName::new("mac")]
        );
        assert!(dag.ancestors("fetch").is_empty());
        assert_eq!(dag.len(), 4);
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = build(vec![
            Job::new("a", &["c"], &["true"]),
            Job::new("b", &["a"], &["true"]),
            Job::new("c", &["b"], &["true"]),
            Job::new("d", &[], &["true"]),
        ])
        .unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::Cycle);
        assert_eq!(err.names, vec!["a", "c", "b", "a"]);
        assert_eq!(err.to_string(), "dependency cycle: a -> c -> b -> a");
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = build(vec![Job::new("a", &["a"], &["true"])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::Cycle);
        assert_eq!(err.names, vec!["a", "a"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = build(vec![Job::new("test", &["build"], &["true"])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
        assert_eq!(err.names, vec!["test", "build"]);
    }

    #[test]
    fn test_duplicate_name() {
        let err = build(vec![
            Job::new("build", &[], &["true"]),
            Job::new("build", &[], &["true"]),
        ])
        .unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DuplicateName);
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let names: Vec<String> = (0..10_000).map(|n| format!("job-{n}")).collect();
        let mut jobs = vec![Job::new(&names[0], &[], &["true"])];
        for pair in names.windows(2) {
            jobs.push(Job::new(&pair[1], &[pair[0].as_str()], &["true"]));
        }
        let dag = build(jobs).unwrap();
        assert_eq!(dag.topological_order().len(), 10_000);
    }

    #[test]
    fn test_build_from_pipeline() {
        let pipeline = PipelineDefinition::from_yaml(
            r#"
executors:
  linux: { platform: linux, arch: x86_64 }
jobs:
  fetch: { executor: linux, steps: [cargo fetch] }
  test: { executor: linux, steps: [cargo test] }
  orphan: { executor: nowhere, steps: ["true"] }
workflows:
  ci:
    timeout_minutes: 10
    jobs:
      - job: fetch
      - job: test
        requires: [fetch]
      - job: test
        name: test-again
        requires: [test]
  broken:
    jobs:
      - job: orphan
  missing:
    jobs:
      - job: ghost
"#,
        )
        .unwrap();

        let results: HashMap<String, Result<WorkflowDag, GraphError>> =
            validate_pipeline(&pipeline).into_iter().collect();

        let ci = results["ci"].as_ref().unwrap();
        assert_eq!(ci.timeout(), Duration::from_secs(600));
        assert_eq!(names(ci.topological_order()), vec!["fetch", "test", "test-again"]);

        let broken = results["broken"].as_ref().unwrap_err();
        assert_eq!(broken.kind, GraphErrorKind::UnknownExecutor);
        assert_eq!(broken.names, vec!["orphan", "nowhere"]);

        let missing = results["missing"].as_ref().unwrap_err();
        assert_eq!(missing.kind, GraphErrorKind::UnknownJob);
    }
}

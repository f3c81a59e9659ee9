use crate::crd::WorkflowStep;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Reasons a workflow spec fails validation. The message is written into
/// the workflow status, so keep these readable for users.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },
    #[error("duplicate step name {0}")]
    DuplicateStep(String),
    #[error("step name {0} must not contain ';'")]
    ReservedSeparator(String),
    #[error("workflow contains a cycle")]
    Cycle,
}

/// DAG of workflow steps. Edges run from a dependency to the step that
/// declares it.
#[derive(Debug)]
pub struct WorkflowDag {
    graph: DiGraph<WorkflowStep, ()>,
    step_indices: HashMap<String, NodeIndex>,
}

impl WorkflowDag {
    /// Build a DAG from the declared steps. Fails on duplicate step names,
    /// dependencies on undeclared steps, and cycles.
    pub fn from_steps(steps: &[WorkflowStep]) -> Result<Self, ValidationError> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for step in steps {
            if step_indices.contains_key(&step.step_name) {
                return Err(ValidationError::DuplicateStep(step.step_name.clone()));
            }
            let node = graph.add_node(step.clone());
            step_indices.insert(step.step_name.clone(), node);
        }

        // Edge from dependency to dependent (dep -> step)
        for step in steps {
            let step_idx = step_indices[&step.step_name];
            for dep in &step.depends_on {
                let dep_idx = step_indices.get(dep).ok_or_else(|| {
                    ValidationError::UnknownDependency {
                        step: step.step_name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.add_edge(*dep_idx, step_idx, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(ValidationError::Cycle);
        }

        Ok(Self {
            graph,
            step_indices,
        })
    }

    /// Steps that become runnable once every step in `executed` has
    /// completed. With an empty `executed` set this is the root set; otherwise
    /// a step is returned iff it is a direct successor of an executed step,
    /// is not itself executed, and all of its predecessors are executed.
    ///
    /// Executed names with no node in the graph are skipped; they occur
    /// transiently after a spec update renames steps.
    pub fn next_runnable(&self, executed: &HashSet<String>) -> HashSet<WorkflowStep> {
        if executed.is_empty() {
            return self.root_steps();
        }

        let mut runnable = HashSet::new();
        for node in executed.iter().filter_map(|name| self.step_indices.get(name)) {
            for succ in self.graph.neighbors_directed(*node, Direction::Outgoing) {
                let step = &self.graph[succ];
                if executed.contains(&step.step_name) {
                    continue;
                }
                // Join semantics: every predecessor must already be executed
                let ready = self
                    .graph
                    .neighbors_directed(succ, Direction::Incoming)
                    .all(|pred| executed.contains(&self.graph[pred].step_name));
                if ready {
                    runnable.insert(step.clone());
                }
            }
        }
        runnable
    }

    /// Steps with no dependencies.
    fn root_steps(&self) -> HashSet<WorkflowStep> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .count()
                    == 0
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }
}

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sentinel value of `maxStepTimeout` that disables timeout monitoring.
pub const NO_TIMEOUT: i64 = -1;

/// A single node in a workflow DAG. Executed as a batch job once every
/// step named in `depends_on` has completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique within the owning workflow. Must not contain `;`, which is
    /// reserved by the step-set annotation encoding.
    pub step_name: String,
    /// Container image to run for this step.
    pub image: String,
    /// Names of steps that must complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional container command override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

/// Workflow custom resource: a user-declared DAG of container steps.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "conveyor.io",
    version = "v1",
    kind = "Workflow",
    plural = "workflows",
    namespaced
)]
#[kube(status = "WorkflowStatus")]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// The workflow steps, each run as a single-container batch job.
    pub containers: Vec<WorkflowStep>,
    /// Maximum seconds the workflow may sit in one status before it is
    /// failed by the timeout monitor. `-1` disables monitoring.
    #[serde(default = "default_max_step_timeout")]
    pub max_step_timeout: i64,
}

fn default_max_step_timeout() -> i64 {
    NO_TIMEOUT
}

/// Lifecycle phase of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum WorkflowPhase {
    /// Validated, no steps started yet.
    Created,
    /// At least one step has been started.
    Started,
    /// All steps completed successfully.
    Completed,
    /// A step failed, validation failed, or the workflow timed out.
    Failed,
}

impl WorkflowPhase {
    /// Terminal phases are absorbing: no further transitions happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed)
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowPhase::Created => "Created",
            WorkflowPhase::Started => "Started",
            WorkflowPhase::Completed => "Completed",
            WorkflowPhase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Status subobject written by the controller. Authoritative for
/// dashboards; `status-changed` feeds the timeout arithmetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowStatus {
    #[serde(rename = "workflow-status")]
    pub workflow_status: WorkflowPhase,
    /// RFC 3339 timestamp of the last status mutation.
    #[serde(rename = "status-changed")]
    pub status_changed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

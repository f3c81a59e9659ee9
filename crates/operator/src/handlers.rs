//! The reconciliation state machine: five event handlers translating
//! cluster events into workflow status transitions and job operations.
//! Every handler is idempotent; duplicate deliveries converge on the same
//! state.

use crate::cluster::ClusterClient;
use anyhow::Result;
use conveyor_core::job::{self, JobFactory};
use conveyor_core::state::WorkflowPatch;
use conveyor_core::{Workflow, WorkflowPhase};
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// One entry of a label diff delivered by the event feed. `new == None`
/// means the label was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelChange {
    pub key: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

fn namespace_of(workflow: &Workflow) -> String {
    workflow.namespace().unwrap_or_else(|| "default".to_string())
}

/// Owns the handler set. One instance serves every workflow; all state
/// lives in the cluster.
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    jobs: JobFactory,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ClusterClient>, jobs: JobFactory) -> Self {
        Self { client, jobs }
    }

    /// Workflow created: validate the spec, then either mark it `Failed`
    /// with the validation message or mark it `Created` and initialize the
    /// step-set annotations.
    pub async fn workflow_created(&self, workflow: &Workflow) -> Result<()> {
        let namespace = namespace_of(workflow);
        let name = workflow.name_any();
        tracing::info!("Handling creation of workflow {}/{}", namespace, name);

        let mut patch = WorkflowPatch::default();
        match workflow.validate() {
            Err(e) => {
                tracing::warn!("Workflow {}/{} failed validation: {}", namespace, name, e);
                patch.set_status(WorkflowPhase::Failed, Some(&e.to_string()));
            }
            Ok(()) => {
                patch.set_status(WorkflowPhase::Created, None);
                patch.init_step_sets();
            }
        }
        self.client.patch_workflow(&namespace, &name, &patch).await
    }

    /// Executed-steps annotation changed: the primary progress tick.
    /// Completes the workflow once every step has executed, otherwise
    /// launches the next runnable steps and records them as started in the
    /// same patch that moves the status to `Started`.
    pub async fn executed_steps_changed(&self, workflow: &Workflow) -> Result<()> {
        let namespace = namespace_of(workflow);
        let name = workflow.name_any();

        if workflow.phase().map(|p| p.is_terminal()).unwrap_or(false) {
            tracing::info!(
                "Workflow {}/{} is already in a finished state, ignoring",
                namespace,
                name
            );
            return Ok(());
        }

        let mut patch = WorkflowPatch::default();
        if workflow.has_finished() {
            tracing::info!("Workflow {}/{} has executed all its steps", namespace, name);
            patch.set_status(WorkflowPhase::Completed, None);
        } else {
            patch.set_status(WorkflowPhase::Started, None);
            let executed: HashSet<String> = workflow.executed_steps().into_iter().collect();
            let to_execute = workflow.steps_to_execute(&executed)?;

            for step in &to_execute {
                tracing::info!(
                    "Starting job for step {} in workflow {}/{}",
                    step.step_name,
                    namespace,
                    name
                );
                let job = self.jobs.build(step, workflow);
                self.client.create_job(&namespace, workflow, job).await?;
            }
            patch.add_started_steps(
                workflow,
                to_execute.iter().map(|s| s.step_name.clone()),
            );
        }
        self.client.patch_workflow(&namespace, &name, &patch).await
    }

    /// Job modified: resolve the owning workflow and step from labels,
    /// then record a completion in executed-steps or fail the workflow.
    /// Terminal workflows absorb the event.
    pub async fn job_event(&self, job: &Job) -> Result<()> {
        let Some(workflow_name) = job::owning_workflow_name(job) else {
            return Ok(());
        };
        let Some(step) = job::step_name(job) else {
            return Ok(());
        };
        let namespace = job.namespace().unwrap_or_else(|| "default".to_string());
        let workflow = self.client.get_workflow(&namespace, workflow_name).await?;

        if workflow.phase().map(|p| p.is_terminal()).unwrap_or(false) {
            return Ok(());
        }

        let mut patch = WorkflowPatch::default();
        if job::has_completed(job) {
            tracing::info!(
                "Job for step {} in workflow {}/{} has completed",
                step,
                namespace,
                workflow_name
            );
            patch.add_executed_step(&workflow, step);
        } else if job::has_failed(job) {
            tracing::info!(
                "Job for step {} in workflow {}/{} has failed",
                step,
                namespace,
                workflow_name
            );
            patch.set_status(
                WorkflowPhase::Failed,
                Some(&format!("Step {} has failed", step)),
            );
        }

        if patch.is_empty() {
            return Ok(());
        }
        self.client
            .patch_workflow(&namespace, workflow_name, &patch)
            .await
    }

    /// Workflow labels changed: mirror the diff onto every owned job.
    pub async fn labels_changed(
        &self,
        workflow: &Workflow,
        diff: &[LabelChange],
    ) -> Result<()> {
        let namespace = namespace_of(workflow);
        let name = workflow.name_any();

        let labels: BTreeMap<String, Option<String>> = diff
            .iter()
            .map(|change| (change.key.clone(), change.new.clone()))
            .collect();
        tracing::info!(
            "Relabeling jobs of workflow {}/{} with {:?}",
            namespace,
            name,
            labels
        );

        for job_name in self
            .client
            .list_job_names_for_workflow(&namespace, &name)
            .await?
        {
            self.client
                .patch_job_labels(&namespace, &job_name, &labels)
                .await?;
        }
        Ok(())
    }

    /// Workflow spec changed: re-validate, reset the step sets, delete the
    /// jobs of the old spec. The executed-steps reset re-triggers the
    /// progress tick, which relaunches the root steps.
    pub async fn spec_changed(&self, workflow: &Workflow) -> Result<()> {
        let namespace = namespace_of(workflow);
        let name = workflow.name_any();
        tracing::info!("Handling spec update of workflow {}/{}", namespace, name);

        let mut patch = WorkflowPatch::default();
        match workflow.validate() {
            Err(e) => {
                patch.set_status(WorkflowPhase::Failed, Some(&e.to_string()));
            }
            Ok(()) => {
                patch.set_status(
                    WorkflowPhase::Created,
                    Some("Restarted job after spec update"),
                );
                patch.init_step_sets();

                for job_name in self
                    .client
                    .list_job_names_for_workflow(&namespace, &name)
                    .await?
                {
                    tracing::info!("Deleting job {} of outdated spec", job_name);
                    self.client.delete_job(&namespace, &job_name).await?;
                }
            }
        }
        self.client.patch_workflow(&namespace, &name, &patch).await
    }
}

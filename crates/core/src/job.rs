//! Builds the batch job for a workflow step and reads completion signals
//! and ownership labels back off job resources.

use crate::crd::{Workflow, WorkflowStep};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Label naming the workflow a job belongs to. Used as the watch selector
/// for job events and to resolve the owning workflow.
pub const OWNING_WORKFLOW_LABEL: &str = "kopf__workflow__kopf";

/// Label naming the workflow step a job executes.
pub const WORKFLOW_STEP_LABEL: &str = "kopf__workflow__step__kopf";

const RESTART_POLICY: &str = "Never";

/// Builds batch jobs for workflow steps. The backoff limit is fixed for
/// the lifetime of the operator process.
#[derive(Debug, Clone)]
pub struct JobFactory {
    backoff_limit: i32,
}

impl JobFactory {
    pub fn new(backoff_limit: i32) -> Self {
        Self { backoff_limit }
    }

    /// Build the job for one step: a single container named after the job,
    /// tagged with the identifying labels and inheriting every label of the
    /// owning workflow. The caller attaches the owner reference before
    /// submitting.
    pub fn build(&self, step: &WorkflowStep, workflow: &Workflow) -> Job {
        let job_name = format!("{}-{}", step.step_name, Uuid::new_v4());

        let mut labels = BTreeMap::new();
        labels.insert(OWNING_WORKFLOW_LABEL.to_string(), workflow.name_any());
        labels.insert(WORKFLOW_STEP_LABEL.to_string(), step.step_name.clone());
        for (key, value) in workflow.labels() {
            labels.insert(key.clone(), value.clone());
        }

        Job {
            metadata: ObjectMeta {
                name: Some(job_name.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(self.backoff_limit),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        restart_policy: Some(RESTART_POLICY.to_string()),
                        containers: vec![Container {
                            name: job_name,
                            image: Some(step.image.clone()),
                            command: step.command.clone(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn has_condition(job: &Job, kind: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == kind && c.status == "True")
        })
        .unwrap_or(false)
}

/// True iff the job carries a `Complete=True` condition.
pub fn has_completed(job: &Job) -> bool {
    has_condition(job, "Complete")
}

/// True iff the job carries a `Failed=True` condition.
pub fn has_failed(job: &Job) -> bool {
    has_condition(job, "Failed")
}

/// Name of the workflow that owns this job, from the identifying label.
pub fn owning_workflow_name(job: &Job) -> Option<&str> {
    job.metadata
        .labels
        .as_ref()?
        .get(OWNING_WORKFLOW_LABEL)
        .map(String::as_str)
}

/// Name of the workflow step this job executes, from the identifying label.
pub fn step_name(job: &Job) -> Option<&str> {
    job.metadata
        .labels
        .as_ref()?
        .get(WORKFLOW_STEP_LABEL)
        .map(String::as_str)
}

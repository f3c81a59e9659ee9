//! In-memory cluster for handler and monitor tests.

use crate::cluster::{owner_reference, ClusterClient};
use anyhow::{bail, Result};
use async_trait::async_trait;
use conveyor_core::state::WorkflowPatch;
use conveyor_core::{job, Workflow, WorkflowSpec, WorkflowStep};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Mutex;

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[derive(Default)]
struct FakeState {
    workflows: BTreeMap<String, Workflow>,
    jobs: BTreeMap<String, Job>,
}

/// [`ClusterClient`] holding all resources in memory. Patches are applied
/// atomically under one lock, which matches the serialization the real
/// resource plane provides.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_workflow(&self, workflow: Workflow) {
        let namespace = workflow.namespace().unwrap_or_else(|| "default".to_string());
        let k = key(&namespace, &workflow.name_any());
        self.state.lock().unwrap().workflows.insert(k, workflow);
    }

    pub fn workflow(&self, namespace: &str, name: &str) -> Workflow {
        self.state
            .lock()
            .unwrap()
            .workflows
            .get(&key(namespace, name))
            .cloned()
            .expect("workflow not found")
    }

    pub fn replace_spec(&self, namespace: &str, name: &str, steps: Vec<WorkflowStep>) {
        let mut state = self.state.lock().unwrap();
        let workflow = state
            .workflows
            .get_mut(&key(namespace, name))
            .expect("workflow not found");
        workflow.spec.containers = steps;
    }

    /// Deleting a workflow garbage-collects every job holding an owner
    /// reference to it, like the cluster would.
    pub fn delete_workflow(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(workflow) = state.workflows.remove(&key(namespace, name)) else {
            return;
        };
        let uid = workflow.uid();
        state.jobs.retain(|_, job| {
            let owned = job
                .metadata
                .owner_references
                .as_ref()
                .map(|refs| refs.iter().any(|r| Some(&r.uid) == uid.as_ref()))
                .unwrap_or(false);
            !owned
        });
    }

    pub fn job(&self, namespace: &str, name: &str) -> Job {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&key(namespace, name))
            .cloned()
            .expect("job not found")
    }

    pub fn jobs_for_workflow(&self, namespace: &str, workflow_name: &str) -> Vec<Job> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| {
                j.metadata.namespace.as_deref() == Some(namespace)
                    && job::owning_workflow_name(j) == Some(workflow_name)
            })
            .cloned()
            .collect()
    }

    pub fn job_for_step(
        &self,
        namespace: &str,
        workflow_name: &str,
        step_name: &str,
    ) -> Option<Job> {
        self.jobs_for_workflow(namespace, workflow_name)
            .into_iter()
            .find(|j| job::step_name(j) == Some(step_name))
    }

    fn set_job_condition(&self, namespace: &str, name: &str, kind: &str) {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(&key(namespace, name))
            .expect("job not found");
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: kind.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    pub fn complete_job(&self, namespace: &str, name: &str) {
        self.set_job_condition(namespace, name, "Complete");
    }

    pub fn fail_job(&self, namespace: &str, name: &str) {
        self.set_job_condition(namespace, name, "Failed");
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Workflow> {
        match self
            .state
            .lock()
            .unwrap()
            .workflows
            .get(&key(namespace, name))
        {
            Some(workflow) => Ok(workflow.clone()),
            None => bail!("workflow {}/{} not found", namespace, name),
        }
    }

    async fn patch_workflow(
        &self,
        namespace: &str,
        name: &str,
        patch: &WorkflowPatch,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.workflows.get_mut(&key(namespace, name)) {
            Some(workflow) => {
                patch.apply_to(workflow);
                Ok(())
            }
            None => bail!("workflow {}/{} not found", namespace, name),
        }
    }

    async fn create_job(&self, namespace: &str, owner: &Workflow, mut job: Job) -> Result<()> {
        job.metadata.namespace = Some(namespace.to_string());
        job.metadata.owner_references = Some(vec![owner_reference(owner)?]);
        let name = job.metadata.name.clone().expect("job has no name");
        self.state
            .lock()
            .unwrap()
            .jobs
            .insert(key(namespace, &name), job);
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.state.lock().unwrap().jobs.remove(&key(namespace, name));
        Ok(())
    }

    async fn list_job_names_for_workflow(
        &self,
        namespace: &str,
        workflow_name: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .jobs_for_workflow(namespace, workflow_name)
            .into_iter()
            .filter_map(|j| j.metadata.name)
            .collect())
    }

    async fn patch_job_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job = match state.jobs.get_mut(&key(namespace, name)) {
            Some(job) => job,
            None => bail!("job {}/{} not found", namespace, name),
        };
        let job_labels = job.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (label, value) in labels {
            match value {
                Some(value) => {
                    job_labels.insert(label.clone(), value.clone());
                }
                None => {
                    job_labels.remove(label);
                }
            }
        }
        Ok(())
    }
}

pub fn make_step(name: &str, depends_on: &[&str]) -> WorkflowStep {
    WorkflowStep {
        step_name: name.to_string(),
        image: "busybox".to_string(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        command: None,
    }
}

pub fn make_workflow(
    namespace: &str,
    name: &str,
    steps: Vec<WorkflowStep>,
    max_step_timeout: i64,
) -> Workflow {
    let mut workflow = Workflow::new(
        name,
        WorkflowSpec {
            containers: steps,
            max_step_timeout,
        },
    );
    workflow.metadata.namespace = Some(namespace.to_string());
    workflow.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
    workflow.metadata.labels = Some(
        [("label".to_string(), "test-label".to_string())]
            .into_iter()
            .collect(),
    );
    workflow
}

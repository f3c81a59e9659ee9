//! The seam between the reconciliation engine and the Kubernetes API.
//! Handlers talk to [`ClusterClient`]; [`KubeClusterClient`] is the
//! production implementation, tests substitute an in-memory cluster.

use anyhow::{Context, Result};
use async_trait::async_trait;
use conveyor_core::job::OWNING_WORKFLOW_LABEL;
use conveyor_core::state::WorkflowPatch;
use conveyor_core::Workflow;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;

/// Cluster operations the reconciliation handlers depend on.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Workflow>;

    /// Apply a workflow patch. The resource plane serializes patches; the
    /// annotation and status parts may be separate requests, which is safe
    /// because every handler is idempotent.
    async fn patch_workflow(
        &self,
        namespace: &str,
        name: &str,
        patch: &WorkflowPatch,
    ) -> Result<()>;

    /// Create a job owned by `owner`. Implementations attach the owner
    /// reference so workflow deletion cascades to the job.
    async fn create_job(&self, namespace: &str, owner: &Workflow, job: Job) -> Result<()>;

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_job_names_for_workflow(
        &self,
        namespace: &str,
        workflow_name: &str,
    ) -> Result<Vec<String>>;

    /// Merge-patch job labels. A `None` value removes the key.
    async fn patch_job_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;
}

/// Owner reference pointing at the workflow, so the cluster garbage
/// collector deletes the job when the workflow goes away.
pub fn owner_reference(workflow: &Workflow) -> Result<OwnerReference> {
    let uid = workflow
        .uid()
        .with_context(|| format!("workflow {} has no uid", workflow.name_any()))?;
    Ok(OwnerReference {
        api_version: Workflow::api_version(&()).into_owned(),
        kind: Workflow::kind(&()).into_owned(),
        name: workflow.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// [`ClusterClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn workflows(&self, namespace: &str) -> Api<Workflow> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Workflow> {
        self.workflows(namespace)
            .get(name)
            .await
            .with_context(|| format!("failed to fetch workflow {}/{}", namespace, name))
    }

    async fn patch_workflow(
        &self,
        namespace: &str,
        name: &str,
        patch: &WorkflowPatch,
    ) -> Result<()> {
        let api = self.workflows(namespace);
        if let Some(metadata) = patch.metadata_patch() {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&metadata))
                .await
                .with_context(|| format!("failed to patch workflow {}/{}", namespace, name))?;
        }
        if let Some(status) = patch.status_patch() {
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
                .await
                .with_context(|| {
                    format!("failed to patch status of workflow {}/{}", namespace, name)
                })?;
        }
        Ok(())
    }

    async fn create_job(&self, namespace: &str, owner: &Workflow, mut job: Job) -> Result<()> {
        job.metadata.owner_references = Some(vec![owner_reference(owner)?]);
        self.jobs(namespace)
            .create(&PostParams::default(), &job)
            .await
            .with_context(|| format!("failed to create job in namespace {}", namespace))?;
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.jobs(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("failed to delete job {}/{}", namespace, name))?;
        Ok(())
    }

    async fn list_job_names_for_workflow(
        &self,
        namespace: &str,
        workflow_name: &str,
    ) -> Result<Vec<String>> {
        let params = ListParams::default()
            .labels(&format!("{}={}", OWNING_WORKFLOW_LABEL, workflow_name));
        let jobs = self
            .jobs(namespace)
            .list(&params)
            .await
            .with_context(|| format!("failed to list jobs in namespace {}", namespace))?;
        Ok(jobs
            .items
            .into_iter()
            .filter_map(|job| job.metadata.name)
            .collect())
    }

    async fn patch_job_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": { "labels": labels }
        });
        self.jobs(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("failed to patch labels of job {}/{}", namespace, name))?;
        Ok(())
    }
}

//! Adapts raw watch deliveries into the typed change events the handlers
//! subscribe to. Keeps a last-seen cache per workflow to derive field-level
//! changes, and tracks job sightings so only modifications reach the job
//! handler.

use crate::handlers::{LabelChange, Reconciler};
use crate::monitor::MonitorRegistry;
use anyhow::Result;
use conveyor_core::job::OWNING_WORKFLOW_LABEL;
use conveyor_core::state::EXECUTED_STEPS_ANNOTATION;
use conveyor_core::Workflow;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Field-level changes derived from consecutive sightings of a workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowChange {
    Created,
    ExecutedStepsChanged,
    LabelsChanged(Vec<LabelChange>),
    SpecChanged,
}

/// Diff two sightings of the same workflow into handler-facing changes.
pub fn diff_workflows(old: &Workflow, new: &Workflow) -> Vec<WorkflowChange> {
    let mut changes = Vec::new();

    if old.spec != new.spec {
        changes.push(WorkflowChange::SpecChanged);
    }

    let old_labels = old.labels();
    let new_labels = new.labels();
    let mut label_changes = Vec::new();
    for (key, new_value) in new_labels {
        let old_value = old_labels.get(key);
        if old_value != Some(new_value) {
            label_changes.push(LabelChange {
                key: key.clone(),
                old: old_value.cloned(),
                new: Some(new_value.clone()),
            });
        }
    }
    for (key, old_value) in old_labels {
        if !new_labels.contains_key(key) {
            label_changes.push(LabelChange {
                key: key.clone(),
                old: Some(old_value.clone()),
                new: None,
            });
        }
    }
    if !label_changes.is_empty() {
        changes.push(WorkflowChange::LabelsChanged(label_changes));
    }

    let executed = |wf: &Workflow| wf.annotations().get(EXECUTED_STEPS_ANNOTATION).cloned();
    if executed(old) != executed(new) {
        changes.push(WorkflowChange::ExecutedStepsChanged);
    }

    changes
}

#[derive(Default)]
struct FeedState {
    workflows: HashMap<String, Workflow>,
    jobs_seen: HashSet<String>,
}

fn resource_key(namespace: &Option<String>, name: &str) -> String {
    format!("{}/{}", namespace.as_deref().unwrap_or("default"), name)
}

/// Runs the watch streams and dispatches changes to the reconciler and the
/// monitor registry.
pub struct Operator {
    reconciler: Arc<Reconciler>,
    monitors: Arc<MonitorRegistry>,
}

impl Operator {
    pub fn new(reconciler: Arc<Reconciler>, monitors: Arc<MonitorRegistry>) -> Self {
        Self {
            reconciler,
            monitors,
        }
    }

    pub async fn run(self, client: Client) -> Result<()> {
        let workflows: Api<Workflow> = Api::all(client.clone());
        let jobs: Api<Job> = Api::all(client);

        let mut workflow_stream = watcher(workflows, watcher::Config::default()).boxed();
        // Only jobs carrying the owning-workflow label are interesting
        let job_config = watcher::Config::default().labels(OWNING_WORKFLOW_LABEL);
        let mut job_stream = watcher(jobs, job_config).boxed();

        let mut state = FeedState::default();
        loop {
            tokio::select! {
                event = workflow_stream.next() => match event {
                    Some(Ok(event)) => self.on_workflow_event(&mut state, event).await,
                    Some(Err(e)) => tracing::warn!("Workflow watch error: {}", e),
                    None => break,
                },
                event = job_stream.next() => match event {
                    Some(Ok(event)) => self.on_job_event(&mut state, event).await,
                    Some(Err(e)) => tracing::warn!("Job watch error: {}", e),
                    None => break,
                },
            }
        }
        Ok(())
    }

    async fn on_workflow_event(&self, state: &mut FeedState, event: watcher::Event<Workflow>) {
        match event {
            watcher::Event::Applied(workflow) => {
                self.observe_workflow(state, workflow).await;
            }
            watcher::Event::Deleted(workflow) => {
                let namespace = workflow.namespace().unwrap_or_else(|| "default".to_string());
                let name = workflow.name_any();
                state.workflows.remove(&resource_key(&workflow.metadata.namespace, &name));
                self.monitors.stop(&namespace, &name);
            }
            watcher::Event::Restarted(list) => {
                // Watch re-established: prime the cache, drop whatever
                // disappeared during the gap.
                let seen: HashSet<String> = list
                    .iter()
                    .map(|wf| resource_key(&wf.metadata.namespace, &wf.name_any()))
                    .collect();
                let gone: Vec<String> = state
                    .workflows
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                for key in gone {
                    state.workflows.remove(&key);
                    if let Some((namespace, name)) = key.split_once('/') {
                        self.monitors.stop(namespace, name);
                    }
                }
                for workflow in list {
                    self.observe_workflow(state, workflow).await;
                }
            }
        }
    }

    async fn observe_workflow(&self, state: &mut FeedState, workflow: Workflow) {
        let namespace = workflow.namespace().unwrap_or_else(|| "default".to_string());
        let name = workflow.name_any();
        let key = resource_key(&workflow.metadata.namespace, &name);

        let old = state.workflows.insert(key, workflow.clone());
        self.monitors.ensure_running(&namespace, &name);

        match old {
            None => {
                // A workflow that already carries a status was seen before
                // a restart of this process; creation ran back then.
                if workflow.status.is_none() {
                    self.dispatch(&workflow, &WorkflowChange::Created).await;
                }
            }
            Some(old) => {
                for change in diff_workflows(&old, &workflow) {
                    self.dispatch(&workflow, &change).await;
                }
            }
        }
    }

    async fn on_job_event(&self, state: &mut FeedState, event: watcher::Event<Job>) {
        match event {
            watcher::Event::Applied(job) => {
                let key = resource_key(&job.metadata.namespace, &job.name_any());
                if state.jobs_seen.insert(key) {
                    // First sighting is the creation; only modifications
                    // carry completion signals.
                    return;
                }
                let result = with_retries(3, || self.reconciler.job_event(&job)).await;
                if let Err(e) = result {
                    tracing::error!("Job event handler failed for {}: {}", job.name_any(), e);
                }
            }
            watcher::Event::Deleted(job) => {
                state
                    .jobs_seen
                    .remove(&resource_key(&job.metadata.namespace, &job.name_any()));
            }
            watcher::Event::Restarted(list) => {
                state.jobs_seen = list
                    .iter()
                    .map(|job| resource_key(&job.metadata.namespace, &job.name_any()))
                    .collect();
            }
        }
    }

    async fn dispatch(&self, workflow: &Workflow, change: &WorkflowChange) {
        let result = with_retries(3, || async {
            match change {
                WorkflowChange::Created => self.reconciler.workflow_created(workflow).await,
                WorkflowChange::ExecutedStepsChanged => {
                    self.reconciler.executed_steps_changed(workflow).await
                }
                WorkflowChange::LabelsChanged(diff) => {
                    self.reconciler.labels_changed(workflow, diff).await
                }
                WorkflowChange::SpecChanged => self.reconciler.spec_changed(workflow).await,
            }
        })
        .await;
        if let Err(e) = result {
            tracing::error!(
                "Handler for {:?} failed on workflow {}: {}",
                change,
                workflow.name_any(),
                e
            );
        }
    }
}

/// Retry a handler a few times with exponential backoff. Handlers are
/// idempotent, so re-running a partially applied one is safe.
async fn with_retries<F, Fut>(attempts: u32, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                tracing::warn!(
                    "Handler attempt {} failed, retrying in {:?}: {}",
                    attempt,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

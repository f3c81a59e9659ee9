//! Per-workflow timeout monitors. One long-lived task per workflow fails
//! it when the current status gets older than `maxStepTimeout` seconds.
//! Since the progress tick refreshes the status on every launch, this
//! bounds the wait for the next batch of completions.

use crate::cluster::ClusterClient;
use conveyor_core::crd::NO_TIMEOUT;
use conveyor_core::state::WorkflowPatch;
use conveyor_core::WorkflowPhase;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay before a fresh monitor starts polling.
    pub initial_delay: Duration,
    /// Interval between timeout checks.
    pub poll_interval: Duration,
}

struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Registry of the running timeout monitors, keyed by workflow.
pub struct MonitorRegistry {
    client: Arc<dyn ClusterClient>,
    config: MonitorConfig,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
}

impl MonitorRegistry {
    pub fn new(client: Arc<dyn ClusterClient>, config: MonitorConfig) -> Self {
        Self {
            client,
            config,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Start a monitor for the workflow unless one is already running.
    pub fn ensure_running(&self, namespace: &str, name: &str) {
        let key = format!("{}/{}", namespace, name);
        let mut monitors = self.monitors.lock().unwrap();
        if let Some(handle) = monitors.get(&key) {
            if !handle.task.is_finished() {
                return;
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(monitor_workflow(
            self.client.clone(),
            namespace.to_string(),
            name.to_string(),
            self.config.clone(),
            stop_rx,
        ));
        monitors.insert(key, MonitorHandle { stop, task });
    }

    /// Stop and forget the monitor of a workflow.
    pub fn stop(&self, namespace: &str, name: &str) {
        let key = format!("{}/{}", namespace, name);
        if let Some(handle) = self.monitors.lock().unwrap().remove(&key) {
            let _ = handle.stop.send(true);
            handle.task.abort();
        }
    }

    /// Stop every monitor; used at operator shutdown.
    pub fn shutdown(&self) {
        for (_, handle) in self.monitors.lock().unwrap().drain() {
            let _ = handle.stop.send(true);
            handle.task.abort();
        }
    }
}

async fn monitor_workflow(
    client: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
    config: MonitorConfig,
    mut stop: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(config.initial_delay) => {}
        _ = stop.changed() => return,
    }

    loop {
        if *stop.borrow() {
            return;
        }

        let workflow = match client.get_workflow(&namespace, &name).await {
            Ok(workflow) => workflow,
            Err(e) => {
                // Transient read failure; the next tick retries. Deletion
                // stops the monitor through the registry.
                tracing::warn!(
                    "Timeout monitor could not read workflow {}/{}: {}",
                    namespace,
                    name,
                    e
                );
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => continue,
                    _ = stop.changed() => return,
                }
            }
        };

        let timeout = workflow.max_step_timeout();
        if timeout == NO_TIMEOUT {
            return;
        }
        if workflow.phase().map(|p| p.is_terminal()).unwrap_or(false) {
            return;
        }

        if let Some(changed_at) = workflow.status_timestamp() {
            let elapsed = (chrono::Utc::now() - changed_at).num_seconds();
            if elapsed > timeout {
                tracing::info!(
                    "Workflow {}/{} exceeded its timeout of {}s (status age {}s)",
                    namespace,
                    name,
                    timeout,
                    elapsed
                );
                let mut patch = WorkflowPatch::default();
                patch.set_status(WorkflowPhase::Failed, Some("Workflow timeout"));
                if let Err(e) = client.patch_workflow(&namespace, &name, &patch).await {
                    tracing::error!(
                        "Failed to mark workflow {}/{} as timed out: {}",
                        namespace,
                        name,
                        e
                    );
                }
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = stop.changed() => return,
        }
    }
}

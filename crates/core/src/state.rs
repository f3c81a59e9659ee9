//! Reads and writes the lifecycle fields of a workflow resource: status,
//! status timestamp, and the executed/started step sets encoded in
//! annotations. All writes go through [`WorkflowPatch`].

use crate::crd::{Workflow, WorkflowPhase, WorkflowStatus, WorkflowStep};
use crate::dag::{ValidationError, WorkflowDag};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub const EXECUTED_STEPS_ANNOTATION: &str = "workflow-executed-steps";
pub const STARTED_STEPS_ANNOTATION: &str = "workflow-started-steps";

/// Separator of the step-set annotation encoding. Step names containing it
/// are rejected at validation.
pub const STEP_SEPARATOR: char = ';';

fn split_step_set(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value.split(STEP_SEPARATOR).map(str::to_string).collect()
}

fn join_step_set(names: &BTreeSet<String>) -> String {
    names
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(&STEP_SEPARATOR.to_string())
}

fn annotation_set(workflow: &Workflow, key: &str) -> Vec<String> {
    workflow
        .annotations()
        .get(key)
        .map(|v| split_step_set(v))
        .unwrap_or_default()
}

impl Workflow {
    /// Names of steps whose jobs have completed successfully.
    pub fn executed_steps(&self) -> Vec<String> {
        annotation_set(self, EXECUTED_STEPS_ANNOTATION)
    }

    /// Names of steps for which a job has been launched.
    pub fn started_steps(&self) -> Vec<String> {
        annotation_set(self, STARTED_STEPS_ANNOTATION)
    }

    /// True once every declared step has executed.
    pub fn has_finished(&self) -> bool {
        let executed: HashSet<String> = self.executed_steps().into_iter().collect();
        executed.len() == self.spec.containers.len()
    }

    pub fn phase(&self) -> Option<WorkflowPhase> {
        self.status.as_ref().map(|s| s.workflow_status)
    }

    /// Timestamp of the last status mutation, if the status has been
    /// written and parses as RFC 3339.
    pub fn status_timestamp(&self) -> Option<DateTime<Utc>> {
        let status = self.status.as_ref()?;
        DateTime::parse_from_rfc3339(&status.status_changed)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn max_step_timeout(&self) -> i64 {
        self.spec.max_step_timeout
    }

    /// Validate the declared steps: no reserved separator in names, no
    /// duplicates, no unknown dependencies, no cycles.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for step in &self.spec.containers {
            if step.step_name.contains(STEP_SEPARATOR) {
                return Err(ValidationError::ReservedSeparator(step.step_name.clone()));
            }
        }
        WorkflowDag::from_steps(&self.spec.containers)?;
        Ok(())
    }

    /// Runnable steps given `executed`, minus steps already in the
    /// started-steps set. The started filter is the idempotence guard: a
    /// duplicate delivery finds every candidate already started and
    /// launches nothing.
    pub fn steps_to_execute(
        &self,
        executed: &HashSet<String>,
    ) -> Result<HashSet<WorkflowStep>, ValidationError> {
        let dag = WorkflowDag::from_steps(&self.spec.containers)?;
        let started: HashSet<String> = self.started_steps().into_iter().collect();
        Ok(dag
            .next_runnable(executed)
            .into_iter()
            .filter(|s| !started.contains(&s.step_name))
            .collect())
    }
}

/// Sparse overlay of the fields a handler wants changed on a workflow.
/// Handlers build one patch and hand it to the cluster client, which is
/// the single apply point.
#[derive(Debug, Clone, Default)]
pub struct WorkflowPatch {
    status: Option<WorkflowStatus>,
    annotations: BTreeMap<String, String>,
}

impl WorkflowPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.annotations.is_empty()
    }

    pub fn status(&self) -> Option<&WorkflowStatus> {
        self.status.as_ref()
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// Set the workflow status, stamping the status-changed timestamp.
    pub fn set_status(&mut self, phase: WorkflowPhase, message: Option<&str>) {
        self.status = Some(WorkflowStatus {
            workflow_status: phase,
            status_changed: Utc::now().to_rfc3339(),
            message: message.map(str::to_string),
        });
    }

    /// Initialize both step-set annotations to the empty set.
    pub fn init_step_sets(&mut self) {
        self.annotations
            .insert(EXECUTED_STEPS_ANNOTATION.to_string(), String::new());
        self.annotations
            .insert(STARTED_STEPS_ANNOTATION.to_string(), String::new());
    }

    /// Write `executed ∪ {step_name}` computed from the current body.
    pub fn add_executed_step(&mut self, workflow: &Workflow, step_name: &str) {
        let mut executed: BTreeSet<String> =
            workflow.executed_steps().into_iter().collect();
        executed.insert(step_name.to_string());
        self.annotations.insert(
            EXECUTED_STEPS_ANNOTATION.to_string(),
            join_step_set(&executed),
        );
    }

    /// Write `started ∪ newly_started` computed from the current body.
    pub fn add_started_steps(
        &mut self,
        workflow: &Workflow,
        newly_started: impl IntoIterator<Item = String>,
    ) {
        let mut started: BTreeSet<String> =
            workflow.started_steps().into_iter().collect();
        started.extend(newly_started);
        self.annotations.insert(
            STARTED_STEPS_ANNOTATION.to_string(),
            join_step_set(&started),
        );
    }

    /// Merge patch for `metadata.annotations`, if any were set.
    pub fn metadata_patch(&self) -> Option<serde_json::Value> {
        if self.annotations.is_empty() {
            return None;
        }
        Some(serde_json::json!({
            "metadata": { "annotations": self.annotations }
        }))
    }

    /// Merge patch for the status subresource, if a status was set.
    pub fn status_patch(&self) -> Option<serde_json::Value> {
        self.status
            .as_ref()
            .map(|status| serde_json::json!({ "status": status }))
    }

    /// Apply the patch to an in-memory workflow document.
    pub fn apply_to(&self, workflow: &mut Workflow) {
        if !self.annotations.is_empty() {
            workflow
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(self.annotations.clone());
        }
        if let Some(status) = &self.status {
            workflow.status = Some(status.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::WorkflowSpec;

    fn step(name: &str, depends_on: &[&str]) -> WorkflowStep {
        WorkflowStep {
            step_name: name.to_string(),
            image: "busybox".to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            command: None,
        }
    }

    fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow::new(
            "test-workflow",
            WorkflowSpec {
                containers: steps,
                max_step_timeout: -1,
            },
        )
    }

    fn set_annotation(wf: &mut Workflow, key: &str, value: &str) {
        wf.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    #[test]
    fn test_empty_encoding_round_trip() {
        assert!(split_step_set("").is_empty());
        assert_eq!(join_step_set(&BTreeSet::new()), "");
    }

    #[test]
    fn test_encoding_round_trip() {
        let set: BTreeSet<String> = ["step0", "step1", "step2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let encoded = join_step_set(&set);
        let decoded: BTreeSet<String> = split_step_set(&encoded).into_iter().collect();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_missing_annotations_read_as_empty_sets() {
        let wf = workflow(vec![step("step0", &[])]);
        assert!(wf.executed_steps().is_empty());
        assert!(wf.started_steps().is_empty());
        assert!(!wf.has_finished());
    }

    #[test]
    fn test_has_finished() {
        let mut wf = workflow(vec![step("step0", &[]), step("step1", &["step0"])]);
        set_annotation(&mut wf, EXECUTED_STEPS_ANNOTATION, "step0");
        assert!(!wf.has_finished());
        set_annotation(&mut wf, EXECUTED_STEPS_ANNOTATION, "step0;step1");
        assert!(wf.has_finished());
    }

    #[test]
    fn test_add_executed_step_deduplicates() {
        let mut wf = workflow(vec![step("step0", &[]), step("step1", &["step0"])]);
        set_annotation(&mut wf, EXECUTED_STEPS_ANNOTATION, "step0");

        let mut patch = WorkflowPatch::default();
        patch.add_executed_step(&wf, "step0");
        assert_eq!(
            patch.annotations().get(EXECUTED_STEPS_ANNOTATION).unwrap(),
            "step0"
        );

        let mut patch = WorkflowPatch::default();
        patch.add_executed_step(&wf, "step1");
        assert_eq!(
            patch.annotations().get(EXECUTED_STEPS_ANNOTATION).unwrap(),
            "step0;step1"
        );
    }

    #[test]
    fn test_init_step_sets_writes_empty_strings() {
        let mut patch = WorkflowPatch::default();
        patch.init_step_sets();
        assert_eq!(patch.annotations().get(EXECUTED_STEPS_ANNOTATION).unwrap(), "");
        assert_eq!(patch.annotations().get(STARTED_STEPS_ANNOTATION).unwrap(), "");
    }

    #[test]
    fn test_steps_to_execute_filters_started() {
        let mut wf = workflow(vec![
            step("step0", &[]),
            step("step1", &["step0"]),
            step("step2", &["step0"]),
        ]);
        set_annotation(&mut wf, EXECUTED_STEPS_ANNOTATION, "step0");
        set_annotation(&mut wf, STARTED_STEPS_ANNOTATION, "step0;step1");

        let executed: HashSet<String> = ["step0".to_string()].into_iter().collect();
        let to_execute = wf.steps_to_execute(&executed).unwrap();
        let names: HashSet<String> =
            to_execute.iter().map(|s| s.step_name.clone()).collect();
        assert_eq!(names, ["step2".to_string()].into_iter().collect());
    }

    #[test]
    fn test_steps_to_execute_is_empty_on_duplicate_delivery() {
        let mut wf = workflow(vec![step("step0", &[]), step("step1", &["step0"])]);
        set_annotation(&mut wf, EXECUTED_STEPS_ANNOTATION, "");
        set_annotation(&mut wf, STARTED_STEPS_ANNOTATION, "step0");

        let to_execute = wf.steps_to_execute(&HashSet::new()).unwrap();
        assert!(to_execute.is_empty());
    }

    #[test]
    fn test_validate_rejects_separator_in_step_name() {
        let wf = workflow(vec![step("bad;name", &[])]);
        let err = wf.validate().unwrap_err();
        assert!(matches!(err, ValidationError::ReservedSeparator(_)));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let wf = workflow(vec![step("step0", &["step1"]), step("step1", &["step0"])]);
        assert!(matches!(wf.validate().unwrap_err(), ValidationError::Cycle));
    }

    #[test]
    fn test_status_round_trip_through_patch() {
        let mut wf = workflow(vec![step("step0", &[])]);
        assert!(wf.phase().is_none());

        let mut patch = WorkflowPatch::default();
        patch.set_status(WorkflowPhase::Created, None);
        patch.init_step_sets();
        patch.apply_to(&mut wf);

        assert_eq!(wf.phase(), Some(WorkflowPhase::Created));
        assert!(wf.status_timestamp().is_some());
        assert!(wf.executed_steps().is_empty());
    }

    #[test]
    fn test_status_patch_shape() {
        let mut patch = WorkflowPatch::default();
        patch.set_status(WorkflowPhase::Failed, Some("Workflow timeout"));
        let value = patch.status_patch().unwrap();
        assert_eq!(value["status"]["workflow-status"], "Failed");
        assert_eq!(value["status"]["message"], "Workflow timeout");
        assert!(patch.metadata_patch().is_none());
    }
}

// Core reconciliation types for the Conveyor workflow operator

pub mod crd;
pub mod dag;
pub mod job;
pub mod state;

pub use crd::{Workflow, WorkflowPhase, WorkflowSpec, WorkflowStatus, WorkflowStep};
pub use dag::{ValidationError, WorkflowDag};
pub use state::WorkflowPatch;

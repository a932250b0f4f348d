pub mod engine;
pub mod states;

pub use engine::{FlowTransitionError, WorkflowState};
pub use states::{BranchOutcome, PipelineStage, WorkflowStatus};

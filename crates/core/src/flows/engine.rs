use thiserror::Error;

use crate::flows::states::{BranchOutcome, WorkflowStatus};

/// Per-message workflow state. Created fresh for every incoming utterance and
/// dropped once the reply is computed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowState {
    status: WorkflowStatus,
    carry: String,
    outcome: Option<BranchOutcome>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self { status: WorkflowStatus::Continue, carry: String::new(), outcome: None }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("branch already concluded as {existing:?}, cannot conclude again as {attempted:?}")]
    BranchAlreadyConcluded { existing: BranchOutcome, attempted: BranchOutcome },
    #[error("every branch stage ran without concluding")]
    NotConcluded,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn carry(&self) -> &str {
        &self.carry
    }

    pub fn outcome(&self) -> Option<&BranchOutcome> {
        self.outcome.as_ref()
    }

    /// True while no stage has concluded the branch; later stages only run
    /// while this holds.
    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }

    /// Records the single branch conclusion for this message.
    pub fn conclude(
        &mut self,
        outcome: BranchOutcome,
        carry: impl Into<String>,
    ) -> Result<(), FlowTransitionError> {
        if let Some(existing) = &self.outcome {
            return Err(FlowTransitionError::BranchAlreadyConcluded {
                existing: existing.clone(),
                attempted: outcome,
            });
        }
        self.status = outcome.status();
        self.carry = carry.into();
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Consumes the state once branching is over, yielding the outcome and
    /// the carry for the suggestion stage.
    pub fn into_concluded(self) -> Result<(BranchOutcome, String), FlowTransitionError> {
        match self.outcome {
            Some(outcome) => Ok((outcome, self.carry)),
            None => Err(FlowTransitionError::NotConcluded),
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::domain::next_step::NextStepTag;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Continue,
    Break,
}

/// Pipeline steps in the order they are attempted for each message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    NextStepDetector,
    DependenciesIdentifier,
    SqlGenerator,
    SqlToHuman,
    NextStepSuggestor,
}

impl PipelineStage {
    pub const ORDER: [PipelineStage; 5] = [
        Self::NextStepDetector,
        Self::DependenciesIdentifier,
        Self::SqlGenerator,
        Self::SqlToHuman,
        Self::NextStepSuggestor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NextStepDetector => "next_step_detector",
            Self::DependenciesIdentifier => "dependencies_identifier",
            Self::SqlGenerator => "sql_generator",
            Self::SqlToHuman => "sql_to_human",
            Self::NextStepSuggestor => "next_step_suggestor",
        }
    }
}

/// Which branch concluded the work for one message before the final
/// suggestion stage ran.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "branch", rename_all = "snake_case")]
pub enum BranchOutcome {
    NextStepDetected { tag: NextStepTag },
    NotStockRelated,
    NotQueryable,
    QueryAnswered { query: String, row_count: usize },
    QueryFailed { query: String },
}

impl BranchOutcome {
    /// A successfully answered query is a completed leaf rather than a
    /// deflection, so it leaves the status at `Continue`.
    pub fn status(&self) -> WorkflowStatus {
        match self {
            Self::QueryAnswered { .. } => WorkflowStatus::Continue,
            _ => WorkflowStatus::Break,
        }
    }

    pub fn concluded_by(&self) -> PipelineStage {
        match self {
            Self::NextStepDetected { .. } => PipelineStage::NextStepDetector,
            Self::NotStockRelated => PipelineStage::DependenciesIdentifier,
            Self::NotQueryable | Self::QueryFailed { .. } => PipelineStage::SqlGenerator,
            Self::QueryAnswered { .. } => PipelineStage::SqlToHuman,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NextStepDetected { .. } => "next_step_detected",
            Self::NotStockRelated => "not_stock_related",
            Self::NotQueryable => "not_queryable",
            Self::QueryAnswered { .. } => "query_answered",
            Self::QueryFailed { .. } => "query_failed",
        }
    }
}

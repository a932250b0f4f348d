pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use domain::conversation::{
    ContextError, ConversationContext, ConversationId, Message, Role, Sayer, StoredEntry,
};
pub use domain::inventory::{
    ensure_read_only, CarListing, InventoryRow, ReadOnlyViolation, INVENTORY_SCHEMA,
    INVENTORY_SCHEMA_VERSION,
};
pub use domain::next_step::NextStepTag;
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{BranchOutcome, FlowTransitionError, PipelineStage, WorkflowState, WorkflowStatus};

use async_trait::async_trait;
use thiserror::Error;

use showroom_core::domain::conversation::{ConversationId, Sayer, StoredEntry};
use showroom_core::domain::inventory::{CarListing, InventoryRow, ReadOnlyViolation};

pub mod conversation;
pub mod inventory;
pub mod memory;

pub use conversation::SqlConversationStore;
pub use inventory::SqlInventoryRepository;
pub use memory::InMemoryConversationStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("query rejected: {0}")]
    ReadOnly(#[from] ReadOnlyViolation),
    #[error("query task failed: {0}")]
    Task(String),
}

/// Read access to the vehicle inventory plus the bulk refresh used by ingestion.
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    /// At most `limit` rows, in no particular order.
    async fn sample(&self, limit: u32) -> Result<Vec<InventoryRow>, RepositoryError>;

    /// Runs model-generated query text verbatim. Anything that is not a single
    /// read-only statement is rejected before it reaches the database.
    async fn execute_readonly(&self, query: &str) -> Result<Vec<InventoryRow>, RepositoryError>;

    /// Swaps the whole inventory. Excludes concurrent reads while it runs.
    async fn replace_all(&self, listings: Vec<CarListing>) -> Result<(), RepositoryError>;
}

/// Append-only transcripts keyed by conversation.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(
        &self,
        id: &ConversationId,
        sayer: Sayer,
        content: &str,
    ) -> Result<(), RepositoryError>;

    /// Records a user utterance and the reply to it as one unit.
    async fn append_turn(
        &self,
        id: &ConversationId,
        utterance: &str,
        reply: &str,
    ) -> Result<(), RepositoryError>;

    async fn read(&self, id: &ConversationId) -> Result<Vec<StoredEntry>, RepositoryError>;

    async fn clear(&self) -> Result<(), RepositoryError>;
}

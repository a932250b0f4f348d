use chrono::{DateTime, Utc};
use sqlx::Row;

use showroom_core::domain::conversation::{ConversationId, Sayer, StoredEntry};

use super::{ConversationStore, RepositoryError};
use crate::DbPool;

pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<StoredEntry, RepositoryError> {
    let timestamp: String =
        row.try_get("timestamp").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let sayer: String = row.try_get("sayer").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let content: String =
        row.try_get("content").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp `{timestamp}`: {e}")))?
        .with_timezone(&Utc);

    // the raw tag is returned as-is; rebuilding the context rejects unknown tags
    Ok(StoredEntry { timestamp, sayer, content })
}

const INSERT_ENTRY: &str =
    "INSERT INTO conversation_entries (conversation_id, timestamp, sayer, content) VALUES (?, ?, ?, ?)";

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn append(
        &self,
        id: &ConversationId,
        sayer: Sayer,
        content: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(INSERT_ENTRY)
            .bind(id.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(sayer.as_str())
            .bind(content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_turn(
        &self,
        id: &ConversationId,
        utterance: &str,
        reply: &str,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let conversation_id = id.to_string();

        for (sayer, content) in [(Sayer::User, utterance), (Sayer::Chatbot, reply)] {
            sqlx::query(INSERT_ENTRY)
                .bind(&conversation_id)
                .bind(Utc::now().to_rfc3339())
                .bind(sayer.as_str())
                .bind(content)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn read(&self, id: &ConversationId) -> Result<Vec<StoredEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT timestamp, sayer, content
             FROM conversation_entries
             WHERE conversation_id = ?
             ORDER BY id ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM conversation_entries").execute(&self.pool).await?;
        Ok(())
    }
}

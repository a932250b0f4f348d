use std::collections::HashMap;

use tokio::sync::RwLock;

use showroom_core::domain::conversation::{ConversationId, Sayer, StoredEntry};

use super::{ConversationStore, RepositoryError};

#[derive(Default)]
pub struct InMemoryConversationStore {
    transcripts: RwLock<HashMap<ConversationId, Vec<StoredEntry>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append(
        &self,
        id: &ConversationId,
        sayer: Sayer,
        content: &str,
    ) -> Result<(), RepositoryError> {
        let mut transcripts = self.transcripts.write().await;
        transcripts.entry(*id).or_default().push(StoredEntry::new(sayer, content));
        Ok(())
    }

    async fn append_turn(
        &self,
        id: &ConversationId,
        utterance: &str,
        reply: &str,
    ) -> Result<(), RepositoryError> {
        let mut transcripts = self.transcripts.write().await;
        let transcript = transcripts.entry(*id).or_default();
        transcript.push(StoredEntry::new(Sayer::User, utterance));
        transcript.push(StoredEntry::new(Sayer::Chatbot, reply));
        Ok(())
    }

    async fn read(&self, id: &ConversationId) -> Result<Vec<StoredEntry>, RepositoryError> {
        let transcripts = self.transcripts.read().await;
        Ok(transcripts.get(id).cloned().unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        self.transcripts.write().await.clear();
        Ok(())
    }
}

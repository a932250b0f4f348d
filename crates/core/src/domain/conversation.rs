use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ConversationId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Developer,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Developer => "developer",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// Who said a stored transcript entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sayer {
    Chatbot,
    User,
}

impl Sayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chatbot => "chatbot",
            Self::User => "user",
        }
    }
}

impl std::str::FromStr for Sayer {
    type Err = ContextError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "chatbot" => Ok(Self::Chatbot),
            "user" => Ok(Self::User),
            other => Err(ContextError::UnknownSayerTag(other.to_string())),
        }
    }
}

/// A transcript entry as persisted. The sayer is kept as the raw stored tag so
/// that corruption is detected when the context is rebuilt, not papered over
/// on read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub timestamp: DateTime<Utc>,
    pub sayer: String,
    pub content: String,
}

impl StoredEntry {
    pub fn new(sayer: Sayer, content: impl Into<String>) -> Self {
        Self { timestamp: Utc::now(), sayer: sayer.as_str().to_string(), content: content.into() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("unknown sayer tag `{0}` in stored transcript")]
    UnknownSayerTag(String),
}

/// Ordered transcript replayed verbatim to the model. Messages are only ever
/// appended; nothing reorders or drops them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    messages: Vec<Message>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(instruction: impl Into<String>) -> Self {
        let mut context = Self::new();
        context.add(Role::Developer, instruction);
        context
    }

    pub fn build_from_stored(entries: &[StoredEntry]) -> Result<Self, ContextError> {
        let mut context = Self::new();
        for entry in entries {
            let role = match entry.sayer.parse::<Sayer>()? {
                Sayer::Chatbot => Role::Assistant,
                Sayer::User => Role::User,
            };
            context.add(role, entry.content.clone());
        }
        Ok(context)
    }

    pub fn add(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(Message::new(role, content));
    }

    /// Appends `other` after the messages already held, keeping both orders.
    pub fn merge(&mut self, other: &ConversationContext) {
        self.messages.extend(other.messages.iter().cloned());
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ContextError, ConversationContext, ConversationId, Role, Sayer, StoredEntry};

    fn context_of(messages: &[(Role, &str)]) -> ConversationContext {
        let mut context = ConversationContext::new();
        for (role, content) in messages {
            context.add(*role, *content);
        }
        context
    }

    #[test]
    fn merge_appends_other_after_self() {
        let mut first = context_of(&[(Role::Developer, "rules"), (Role::User, "hi")]);
        let second = context_of(&[(Role::Assistant, "hello"), (Role::User, "suv?")]);

        first.merge(&second);

        let contents: Vec<&str> = first.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["rules", "hi", "hello", "suv?"]);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn merge_is_not_commutative() {
        let a = context_of(&[(Role::User, "a")]);
        let b = context_of(&[(Role::Assistant, "b")]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_ne!(ab, ba);
        assert_eq!(ab.messages()[0].content, "a");
        assert_eq!(ba.messages()[0].content, "b");
    }

    #[test]
    fn merge_with_empty_contexts_keeps_lengths() {
        let mut empty = ConversationContext::new();
        let populated = context_of(&[(Role::User, "x"), (Role::Assistant, "y")]);

        empty.merge(&populated);
        assert_eq!(empty, populated);

        let mut populated_copy = populated.clone();
        populated_copy.merge(&ConversationContext::new());
        assert_eq!(populated_copy, populated);
    }

    #[test]
    fn build_from_stored_maps_sayers_to_roles_in_order() {
        let entries = vec![
            StoredEntry::new(Sayer::User, "Do you have hybrids?"),
            StoredEntry::new(Sayer::Chatbot, "We have three."),
            StoredEntry::new(Sayer::User, "Cheapest one?"),
        ];

        let context = ConversationContext::build_from_stored(&entries).expect("known sayers");

        let roles: Vec<Role> = context.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(context.messages()[2].content, "Cheapest one?");
    }

    #[test]
    fn build_from_stored_rejects_unknown_sayer() {
        let entries = vec![
            StoredEntry::new(Sayer::User, "hi"),
            StoredEntry { timestamp: Utc::now(), sayer: "system".to_string(), content: "?".into() },
        ];

        let error = ConversationContext::build_from_stored(&entries).expect_err("corrupt tag");
        assert_eq!(error, ContextError::UnknownSayerTag("system".to_string()));
    }

    #[test]
    fn seeded_context_starts_with_developer_instruction() {
        let context = ConversationContext::seeded("be helpful");
        assert_eq!(context.messages()[0].role, Role::Developer);
        assert_eq!(context.messages()[0].role.as_str(), "developer");
    }

    #[test]
    fn conversation_id_round_trips_through_display() {
        let id = ConversationId::new();
        let parsed: ConversationId = id.to_string().parse().expect("uuid text");
        assert_eq!(parsed, id);
    }
}

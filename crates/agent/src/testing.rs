//! Deterministic collaborators for exercising the workflow without a model
//! provider or a database.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use showroom_core::domain::conversation::ConversationContext;
use showroom_core::domain::inventory::{ensure_read_only, CarListing, InventoryRow};
use showroom_db::repositories::{InventoryRepository, RepositoryError};

use crate::llm::{LanguageModelCapability, LlmError, OutputShape};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    /// `None` for free-text calls.
    pub shape: Option<&'static str>,
    pub context: ConversationContext,
}

/// Replays queued answers per output shape and records every context it is
/// shown. An empty queue answers with `LlmError::Unavailable`.
#[derive(Default)]
pub struct ScriptedCapability {
    structured: Mutex<HashMap<&'static str, VecDeque<Result<Value, LlmError>>>>,
    text: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_structured(&self, shape: &'static str, value: Value) {
        locked(&self.structured).entry(shape).or_default().push_back(Ok(value));
    }

    pub fn push_structured_error(&self, shape: &'static str, error: LlmError) {
        locked(&self.structured).entry(shape).or_default().push_back(Err(error));
    }

    pub fn push_text(&self, text: impl Into<String>) {
        locked(&self.text).push_back(Ok(text.into()));
    }

    pub fn push_text_error(&self, error: LlmError) {
        locked(&self.text).push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        locked(&self.calls).clone()
    }

    /// Shape names in call order, with `"text"` standing in for free-text calls.
    pub fn call_order(&self) -> Vec<&'static str> {
        locked(&self.calls).iter().map(|call| call.shape.unwrap_or("text")).collect()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl LanguageModelCapability for ScriptedCapability {
    async fn generate_text(&self, context: &ConversationContext) -> Result<String, LlmError> {
        locked(&self.calls).push(RecordedCall { shape: None, context: context.clone() });
        self.pause().await;
        locked(&self.text)
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Unavailable("no scripted text reply".to_string())))
    }

    async fn generate_structured_value(
        &self,
        context: &ConversationContext,
        shape: &OutputShape,
    ) -> Result<Value, LlmError> {
        locked(&self.calls).push(RecordedCall { shape: Some(shape.name), context: context.clone() });
        self.pause().await;
        locked(&self.structured).get_mut(shape.name).and_then(VecDeque::pop_front).unwrap_or_else(
            || Err(LlmError::Unavailable(format!("no scripted reply for `{}`", shape.name))),
        )
    }
}

/// Fixed inventory that records the queries it is asked to run. Queries pass
/// the same read-only check as the SQL repository before the canned rows
/// are returned.
#[derive(Default)]
pub struct StaticInventory {
    rows: Vec<InventoryRow>,
    fail_queries: bool,
    queries: Mutex<Vec<String>>,
    sample_limits: Mutex<Vec<u32>>,
    replaced: Mutex<Vec<usize>>,
}

impl StaticInventory {
    pub fn with_rows(rows: Vec<InventoryRow>) -> Self {
        Self { rows, ..Self::default() }
    }

    pub fn failing() -> Self {
        Self { fail_queries: true, ..Self::default() }
    }

    pub fn queries(&self) -> Vec<String> {
        locked(&self.queries).clone()
    }

    pub fn sample_limits(&self) -> Vec<u32> {
        locked(&self.sample_limits).clone()
    }

    pub fn replaced_batches(&self) -> Vec<usize> {
        locked(&self.replaced).clone()
    }
}

#[async_trait]
impl InventoryRepository for StaticInventory {
    async fn sample(&self, limit: u32) -> Result<Vec<InventoryRow>, RepositoryError> {
        locked(&self.sample_limits).push(limit);
        Ok(self.rows.iter().take(limit as usize).cloned().collect())
    }

    async fn execute_readonly(&self, query: &str) -> Result<Vec<InventoryRow>, RepositoryError> {
        locked(&self.queries).push(query.to_string());
        ensure_read_only(query)?;
        if self.fail_queries {
            return Err(RepositoryError::Decode(format!("cannot run `{query}`")));
        }
        Ok(self.rows.clone())
    }

    async fn replace_all(&self, listings: Vec<CarListing>) -> Result<(), RepositoryError> {
        locked(&self.replaced).push(listings.len());
        Ok(())
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use showroom_core::domain::conversation::{
    ContextError, ConversationContext, ConversationId, StoredEntry,
};
use showroom_core::domain::next_step::NextStepTag;
use showroom_core::errors::{ApplicationError, DomainError};
use showroom_core::flows::{BranchOutcome, FlowTransitionError, PipelineStage, WorkflowState};
use showroom_db::repositories::{ConversationStore, InventoryRepository, RepositoryError};

use crate::llm::{LanguageModelCapability, LlmError};
use crate::stages::{
    DependenciesIdentifier, NextStepDetector, NextStepSuggestor, SqlGenerator, SqlToHuman,
    Verdict,
};

/// Carry handed to the suggestion stage when generated query text cannot be run.
pub const QUERY_FAILED_APOLOGY: &str = "I'm sorry, I couldn't look that up in our inventory \
right now. Could you tell me a bit more about the car you have in mind?";

pub const DEFAULT_SAMPLE_SIZE: u32 = 5;
pub const DEFAULT_MAX_QUERY_ROWS: usize = 50;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("stage `{}` failed: {source}", .stage.as_str())]
    Capability {
        stage: PipelineStage,
        #[source]
        source: LlmError,
    },
    #[error("conversation store failure: {0}")]
    Store(#[source] RepositoryError),
    #[error("inventory sample failure: {0}")]
    Inventory(#[source] RepositoryError),
    #[error(transparent)]
    Flow(#[from] FlowTransitionError),
}

impl WorkflowError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Capability { source, .. } => source.is_retryable(),
            Self::Store(_) | Self::Inventory(_) => true,
            _ => false,
        }
    }
}

impl From<WorkflowError> for ApplicationError {
    fn from(value: WorkflowError) -> Self {
        match value {
            WorkflowError::EmptyPrompt => {
                DomainError::InvariantViolation("prompt must not be empty".to_string()).into()
            }
            WorkflowError::Context(error) => DomainError::Context(error).into(),
            WorkflowError::Flow(error) => DomainError::FlowTransition(error).into(),
            error @ WorkflowError::Capability { .. } => Self::Integration(error.to_string()),
            error @ (WorkflowError::Store(_) | WorkflowError::Inventory(_)) => {
                Self::Persistence(error.to_string())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowReply {
    pub message: String,
    pub outcome: BranchOutcome,
    pub suggested_next_step: Option<NextStepTag>,
}

/// One mutex per conversation, dropped from the map once nobody holds or
/// waits on it.
#[derive(Default)]
struct ConversationLocks {
    slots: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    async fn acquire(&self, id: ConversationId) -> TurnLease<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(id).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        TurnLease { locks: self, id, slot: Some(slot), guard: Some(guard) }
    }

    fn release(&self, id: &ConversationId, slot: Arc<tokio::sync::Mutex<()>>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        drop(slot);
        if slots.get(id).is_some_and(|held| Arc::strong_count(held) == 1) {
            slots.remove(id);
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct TurnLease<'a> {
    locks: &'a ConversationLocks,
    id: ConversationId,
    slot: Option<Arc<tokio::sync::Mutex<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        if let Some(slot) = self.slot.take() {
            self.locks.release(&self.id, slot);
        }
    }
}

/// Runs the per-message stage pipeline.
///
/// Branches are tried in a fixed priority order: a requested next step, then
/// stock relevance, then queryability and execution. The first one that
/// concludes provides the carry, and the suggestion stage always runs last on
/// that carry. Messages for one conversation are processed one at a time;
/// different conversations run concurrently. The transcript is only written
/// once a reply exists, so a failed turn leaves no trace.
pub struct WorkflowOrchestrator {
    detector: NextStepDetector,
    dependencies: DependenciesIdentifier,
    sql_generator: SqlGenerator,
    sql_to_human: SqlToHuman,
    suggestor: NextStepSuggestor,
    store: Arc<dyn ConversationStore>,
    inventory: Arc<dyn InventoryRepository>,
    locks: ConversationLocks,
    sample_size: u32,
    max_query_rows: usize,
    stage_timeout: Option<Duration>,
}

impl WorkflowOrchestrator {
    pub fn new(
        capability: Arc<dyn LanguageModelCapability>,
        store: Arc<dyn ConversationStore>,
        inventory: Arc<dyn InventoryRepository>,
    ) -> Self {
        Self {
            detector: NextStepDetector::new(capability.clone()),
            dependencies: DependenciesIdentifier::new(capability.clone()),
            sql_generator: SqlGenerator::new(capability.clone()),
            sql_to_human: SqlToHuman::new(capability.clone()),
            suggestor: NextStepSuggestor::new(capability),
            store,
            inventory,
            locks: ConversationLocks::default(),
            sample_size: DEFAULT_SAMPLE_SIZE,
            max_query_rows: DEFAULT_MAX_QUERY_ROWS,
            stage_timeout: None,
        }
    }

    pub fn with_sample_size(mut self, sample_size: u32) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    pub fn with_max_query_rows(mut self, max_query_rows: usize) -> Self {
        self.max_query_rows = max_query_rows.max(1);
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    pub async fn handle_message(
        &self,
        conversation_id: &ConversationId,
        utterance: &str,
    ) -> Result<WorkflowReply, WorkflowError> {
        if utterance.trim().is_empty() {
            return Err(WorkflowError::EmptyPrompt);
        }

        let _lease = self.locks.acquire(*conversation_id).await;

        let entries = self.store.read(conversation_id).await.map_err(WorkflowError::Store)?;
        let prior = ConversationContext::build_from_stored(&entries)?;

        let mut state = WorkflowState::new();
        self.detect_next_step(&mut state, utterance, &prior).await?;
        if state.is_open() {
            self.check_stock_relevance(&mut state, utterance, &prior).await?;
        }
        if state.is_open() {
            self.answer_from_inventory(&mut state, conversation_id, utterance, &prior).await?;
        }

        let status = state.status();
        let (outcome, carry) = state.into_concluded()?;
        info!(
            event_name = "agent.workflow.branch_concluded",
            conversation_id = %conversation_id,
            branch = outcome.label(),
            concluded_by = outcome.concluded_by().as_str(),
            status = ?status,
            "workflow branch concluded"
        );

        let suggestion = self
            .call_stage(PipelineStage::NextStepSuggestor, self.suggestor.run(&carry, &prior))
            .await?;

        self.store
            .append_turn(conversation_id, utterance, &suggestion.message)
            .await
            .map_err(WorkflowError::Store)?;

        Ok(WorkflowReply {
            message: suggestion.message,
            outcome,
            suggested_next_step: suggestion.known_next_step,
        })
    }

    /// Transcript of a conversation, read under its lock so it never
    /// interleaves with a turn in progress.
    pub async fn transcript(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<StoredEntry>, WorkflowError> {
        let _lease = self.locks.acquire(*conversation_id).await;
        self.store.read(conversation_id).await.map_err(WorkflowError::Store)
    }

    /// Closes a conversation and returns its transcript for hand-off to sales staff.
    pub async fn end_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<StoredEntry>, WorkflowError> {
        let entries = self.transcript(conversation_id).await?;
        info!(
            event_name = "agent.workflow.conversation_ended",
            conversation_id = %conversation_id,
            entry_count = entries.len(),
            "conversation ended"
        );
        Ok(entries)
    }

    pub fn active_conversations(&self) -> usize {
        self.locks.len()
    }

    async fn detect_next_step(
        &self,
        state: &mut WorkflowState,
        utterance: &str,
        prior: &ConversationContext,
    ) -> Result<(), WorkflowError> {
        let judgment = self
            .call_stage(PipelineStage::NextStepDetector, self.detector.run(utterance, prior))
            .await?;

        if let Some(tag) = judgment.known_next_step {
            state.conclude(BranchOutcome::NextStepDetected { tag }, judgment.message)?;
        }
        Ok(())
    }

    async fn check_stock_relevance(
        &self,
        state: &mut WorkflowState,
        utterance: &str,
        prior: &ConversationContext,
    ) -> Result<(), WorkflowError> {
        let judgment = self
            .call_stage(
                PipelineStage::DependenciesIdentifier,
                self.dependencies.run(utterance, prior),
            )
            .await?;

        if judgment.stock_related == Verdict::No {
            state.conclude(BranchOutcome::NotStockRelated, judgment.message)?;
        }
        Ok(())
    }

    /// Always concludes: with an answer, a clarifying question or an apology.
    async fn answer_from_inventory(
        &self,
        state: &mut WorkflowState,
        conversation_id: &ConversationId,
        utterance: &str,
        prior: &ConversationContext,
    ) -> Result<(), WorkflowError> {
        let sample =
            self.inventory.sample(self.sample_size).await.map_err(WorkflowError::Inventory)?;

        let judgment = self
            .call_stage(
                PipelineStage::SqlGenerator,
                self.sql_generator.run(utterance, &sample, prior),
            )
            .await?;

        if judgment.is_query == Verdict::No {
            state.conclude(BranchOutcome::NotQueryable, judgment.message)?;
            return Ok(());
        }

        let query = judgment.message;
        let mut rows = match self.inventory.execute_readonly(&query).await {
            Ok(rows) => rows,
            Err(error) => {
                warn!(
                    event_name = "agent.workflow.query_failed",
                    conversation_id = %conversation_id,
                    error = %error,
                    "generated query could not be executed"
                );
                state.conclude(BranchOutcome::QueryFailed { query }, QUERY_FAILED_APOLOGY)?;
                return Ok(());
            }
        };

        let row_count = rows.len();
        rows.truncate(self.max_query_rows);

        let answer = self
            .call_stage(PipelineStage::SqlToHuman, self.sql_to_human.run(&rows, &query, prior))
            .await?;

        state.conclude(BranchOutcome::QueryAnswered { query, row_count }, answer)?;
        Ok(())
    }

    async fn call_stage<T>(
        &self,
        stage: PipelineStage,
        call: impl Future<Output = Result<T, LlmError>>,
    ) -> Result<T, WorkflowError> {
        debug!(event_name = "agent.workflow.stage_started", stage = stage.as_str(), "stage started");

        let result = match self.stage_timeout {
            Some(after) => match tokio::time::timeout(after, call).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout { after }),
            },
            None => call.await,
        };

        result.map_err(|source| {
            error!(
                event_name = "agent.workflow.stage_failed",
                stage = stage.as_str(),
                error = %source,
                "stage failed"
            );
            WorkflowError::Capability { stage, source }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use showroom_core::domain::conversation::{
        ContextError, ConversationId, Role, Sayer, StoredEntry,
    };
    use showroom_core::domain::inventory::InventoryRow;
    use showroom_core::domain::next_step::NextStepTag;
    use showroom_core::errors::{ApplicationError, DomainError};
    use showroom_core::flows::{BranchOutcome, FlowTransitionError, PipelineStage};
    use showroom_db::repositories::{ConversationStore, InMemoryConversationStore, RepositoryError};

    use super::{WorkflowError, WorkflowOrchestrator, QUERY_FAILED_APOLOGY};
    use crate::llm::{LlmError, StructuredJudgment};
    use crate::stages::{
        NextStepJudgment, NextStepSuggestor, QueryJudgment, SqlToHuman, StockRelevanceJudgment,
        SuggestionJudgment,
    };
    use crate::testing::{ScriptedCapability, StaticInventory};

    const DETECTION: &str = NextStepJudgment::SHAPE.name;
    const RELEVANCE: &str = StockRelevanceJudgment::SHAPE.name;
    const QUERY: &str = QueryJudgment::SHAPE.name;
    const SUGGESTION: &str = SuggestionJudgment::SHAPE.name;

    struct Harness {
        capability: Arc<ScriptedCapability>,
        store: Arc<InMemoryConversationStore>,
        inventory: Arc<StaticInventory>,
        orchestrator: WorkflowOrchestrator,
    }

    fn harness_with(capability: ScriptedCapability, inventory: StaticInventory) -> Harness {
        let capability = Arc::new(capability);
        let store = Arc::new(InMemoryConversationStore::new());
        let inventory = Arc::new(inventory);
        let orchestrator =
            WorkflowOrchestrator::new(capability.clone(), store.clone(), inventory.clone());
        Harness { capability, store, inventory, orchestrator }
    }

    fn harness() -> Harness {
        harness_with(ScriptedCapability::new(), StaticInventory::with_rows(vec![suv("Toyota")]))
    }

    fn suv(make: &str) -> InventoryRow {
        let mut row = InventoryRow::new();
        row.insert("make".to_string(), json!(make));
        row.insert("body_style".to_string(), json!("SUV"));
        row
    }

    fn no_next_step(capability: &ScriptedCapability) {
        capability.push_structured(DETECTION, json!({"known_next_step": null, "message": ""}));
    }

    fn suggest(capability: &ScriptedCapability, message: &str) {
        capability
            .push_structured(SUGGESTION, json!({"known_next_step": null, "message": message}));
    }

    fn last_prompt(capability: &ScriptedCapability, shape: &str) -> String {
        capability
            .calls()
            .into_iter()
            .filter(|call| call.shape.unwrap_or("text") == shape)
            .last()
            .and_then(|call| call.context.messages().last().map(|m| m.content.clone()))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn general_question_stops_at_stock_relevance() {
        let h = harness();
        no_next_step(&h.capability);
        h.capability.push_structured(
            RELEVANCE,
            json!({"stock_related": "NO", "message": "That's a general question, here's the policy..."}),
        );
        suggest(&h.capability, "Returns are accepted within 30 days. Want to see our SUVs?");

        let id = ConversationId::new();
        let reply = h
            .orchestrator
            .handle_message(&id, "What's your return policy?")
            .await
            .expect("reply");

        assert_eq!(reply.message, "Returns are accepted within 30 days. Want to see our SUVs?");
        assert_eq!(reply.outcome, BranchOutcome::NotStockRelated);
        assert_eq!(h.capability.call_order(), vec![DETECTION, RELEVANCE, SUGGESTION]);
        assert!(h.inventory.sample_limits().is_empty());
        assert!(h.inventory.queries().is_empty());
        assert_eq!(
            last_prompt(&h.capability, SUGGESTION),
            NextStepSuggestor::prompt_for("That's a general question, here's the policy...")
        );
    }

    #[tokio::test]
    async fn test_drive_request_breaks_immediately() {
        let h = harness();
        h.capability.push_structured(
            DETECTION,
            json!({"known_next_step": "TEST_DRIVE", "message": "Happy to book that test drive!"}),
        );
        h.capability.push_structured(
            SUGGESTION,
            json!({"known_next_step": "TEST_DRIVE", "message": "Which day suits you?"}),
        );

        let reply = h
            .orchestrator
            .handle_message(&ConversationId::new(), "I want to book a test drive for the blue sedan")
            .await
            .expect("reply");

        assert_eq!(reply.outcome, BranchOutcome::NextStepDetected { tag: NextStepTag::TestDrive });
        assert_eq!(reply.suggested_next_step, Some(NextStepTag::TestDrive));
        assert_eq!(h.capability.call_order(), vec![DETECTION, SUGGESTION]);
        assert!(last_prompt(&h.capability, SUGGESTION).ends_with("Happy to book that test drive!"));
        assert!(h.inventory.queries().is_empty());
    }

    #[tokio::test]
    async fn inventory_question_executes_the_generated_query_verbatim() {
        let h = harness_with(
            ScriptedCapability::new(),
            StaticInventory::with_rows(vec![suv("Toyota"), suv("Ford")]),
        );
        let query = "SELECT * FROM cars WHERE body_style LIKE '%SUV%' AND sale_price < 30000";
        no_next_step(&h.capability);
        h.capability.push_structured(RELEVANCE, json!({"stock_related": "YES", "message": ""}));
        h.capability.push_structured(QUERY, json!({"is_query": "YES", "message": query}));
        h.capability.push_text("We have a Toyota and a Ford SUV under $30k.");
        suggest(&h.capability, "We have a Toyota and a Ford SUV under $30k.\n\n\nFancy a test drive?");

        let id = ConversationId::new();
        let reply = h.orchestrator.handle_message(&id, "Show me SUVs under $30k").await.expect("reply");

        assert_eq!(h.inventory.queries(), vec![query.to_string()]);
        assert_eq!(h.inventory.sample_limits(), vec![5]);
        assert_eq!(
            reply.outcome,
            BranchOutcome::QueryAnswered { query: query.to_string(), row_count: 2 }
        );
        assert_eq!(h.capability.call_order(), vec![DETECTION, RELEVANCE, QUERY, "text", SUGGESTION]);
        assert_eq!(
            last_prompt(&h.capability, SUGGESTION),
            NextStepSuggestor::prompt_for("We have a Toyota and a Ford SUV under $30k.")
        );

        let transcript = h.store.read(&id).await.expect("read");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].sayer, "user");
        assert_eq!(transcript[0].content, "Show me SUVs under $30k");
        assert_eq!(transcript[1].sayer, "chatbot");
        assert_eq!(transcript[1].content, reply.message);
    }

    #[tokio::test]
    async fn unqueryable_request_breaks_before_execution() {
        let h = harness();
        no_next_step(&h.capability);
        h.capability.push_structured(RELEVANCE, json!({"stock_related": "YES", "message": ""}));
        h.capability.push_structured(
            QUERY,
            json!({"is_query": "NO", "message": "What budget do you have in mind?"}),
        );
        suggest(&h.capability, "What budget do you have in mind?");

        let reply = h
            .orchestrator
            .handle_message(&ConversationId::new(), "I need a car")
            .await
            .expect("reply");

        assert_eq!(reply.outcome, BranchOutcome::NotQueryable);
        assert!(h.inventory.queries().is_empty());
        assert_eq!(h.capability.call_order(), vec![DETECTION, RELEVANCE, QUERY, SUGGESTION]);
    }

    #[tokio::test]
    async fn failed_query_becomes_an_apology_instead_of_an_error() {
        let h = harness_with(ScriptedCapability::new(), StaticInventory::failing());
        no_next_step(&h.capability);
        h.capability.push_structured(RELEVANCE, json!({"stock_related": "YES", "message": ""}));
        h.capability
            .push_structured(QUERY, json!({"is_query": "YES", "message": "SELECT * FROM trucks"}));
        suggest(&h.capability, "Sorry about that! Tell me more?");

        let id = ConversationId::new();
        let reply = h.orchestrator.handle_message(&id, "Any trucks?").await.expect("reply");

        assert_eq!(
            reply.outcome,
            BranchOutcome::QueryFailed { query: "SELECT * FROM trucks".to_string() }
        );
        assert_eq!(
            last_prompt(&h.capability, SUGGESTION),
            NextStepSuggestor::prompt_for(QUERY_FAILED_APOLOGY)
        );
        assert!(!h.capability.call_order().contains(&"text"));
        assert_eq!(h.store.read(&id).await.expect("read").len(), 2);
    }

    #[tokio::test]
    async fn write_statement_from_the_model_is_never_run() {
        let h = harness();
        no_next_step(&h.capability);
        h.capability.push_structured(RELEVANCE, json!({"stock_related": "YES", "message": ""}));
        h.capability
            .push_structured(QUERY, json!({"is_query": "YES", "message": "DROP TABLE cars"}));
        suggest(&h.capability, "Sorry!");

        let reply = h
            .orchestrator
            .handle_message(&ConversationId::new(), "delete everything")
            .await
            .expect("reply");

        assert!(matches!(reply.outcome, BranchOutcome::QueryFailed { .. }));
    }

    #[tokio::test]
    async fn executed_rows_are_truncated_before_reformulation() {
        let capability = ScriptedCapability::new();
        let inventory =
            StaticInventory::with_rows(vec![suv("Toyota"), suv("Ford"), suv("Kia")]);
        let mut h = harness_with(capability, inventory);
        h.orchestrator = WorkflowOrchestrator::new(
            h.capability.clone(),
            h.store.clone(),
            h.inventory.clone(),
        )
        .with_max_query_rows(2)
        .with_sample_size(1);

        no_next_step(&h.capability);
        h.capability.push_structured(RELEVANCE, json!({"stock_related": "YES", "message": ""}));
        h.capability.push_structured(QUERY, json!({"is_query": "YES", "message": "SELECT * FROM cars"}));
        h.capability.push_text("Three SUVs.");
        suggest(&h.capability, "Three SUVs.");

        let reply = h
            .orchestrator
            .handle_message(&ConversationId::new(), "all SUVs")
            .await
            .expect("reply");

        assert_eq!(
            reply.outcome,
            BranchOutcome::QueryAnswered { query: "SELECT * FROM cars".to_string(), row_count: 3 }
        );
        assert_eq!(h.inventory.sample_limits(), vec![1]);
        assert_eq!(
            last_prompt(&h.capability, "text"),
            SqlToHuman::prompt_for(&[suv("Toyota"), suv("Ford")], "SELECT * FROM cars")
        );
    }

    #[tokio::test]
    async fn schema_violation_surfaces_and_leaves_the_store_untouched() {
        let h = harness();
        h.capability.push_structured(DETECTION, json!({"known_next_step": "TEST_DRIVE"}));

        let id = ConversationId::new();
        let error = h.orchestrator.handle_message(&id, "test drive please").await.unwrap_err();

        assert!(matches!(
            error,
            WorkflowError::Capability {
                stage: PipelineStage::NextStepDetector,
                source: LlmError::SchemaViolation { .. },
            }
        ));
        assert!(!error.is_retryable());
        assert!(h.store.read(&id).await.expect("read").is_empty());

        // the next message on the same conversation still goes through
        h.capability.push_structured(
            DETECTION,
            json!({"known_next_step": "TEST_DRIVE", "message": "Booked!"}),
        );
        suggest(&h.capability, "See you Saturday.");
        let reply = h.orchestrator.handle_message(&id, "test drive please").await.expect("reply");
        assert_eq!(reply.message, "See you Saturday.");
        assert_eq!(h.store.read(&id).await.expect("read").len(), 2);
    }

    #[tokio::test]
    async fn failure_in_the_final_stage_records_nothing() {
        let h = harness();
        no_next_step(&h.capability);
        h.capability.push_structured(RELEVANCE, json!({"stock_related": "NO", "message": "Hi!"}));
        h.capability.push_structured(SUGGESTION, json!({"known_next_step": "SOMETHING", "message": "x"}));

        let id = ConversationId::new();
        let error = h.orchestrator.handle_message(&id, "hello").await.unwrap_err();

        assert!(matches!(
            error,
            WorkflowError::Capability { stage: PipelineStage::NextStepSuggestor, .. }
        ));
        assert!(h.store.read(&id).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn reformulation_outage_fails_the_turn_and_records_nothing() {
        let h = harness();
        no_next_step(&h.capability);
        h.capability.push_structured(RELEVANCE, json!({"stock_related": "YES", "message": ""}));
        h.capability
            .push_structured(QUERY, json!({"is_query": "YES", "message": "SELECT * FROM cars"}));
        h.capability.push_text_error(LlmError::Unavailable("upstream reset".to_string()));

        let id = ConversationId::new();
        let error = h.orchestrator.handle_message(&id, "Any SUVs?").await.unwrap_err();

        assert!(matches!(
            error,
            WorkflowError::Capability { stage: PipelineStage::SqlToHuman, .. }
        ));
        assert!(error.is_retryable());
        assert_eq!(h.inventory.queries(), vec!["SELECT * FROM cars".to_string()]);
        assert_eq!(h.capability.call_order(), vec![DETECTION, RELEVANCE, QUERY, "text"]);
        assert!(h.store.read(&id).await.expect("read").is_empty());
    }

    #[test]
    fn unconcluded_branch_is_an_internal_failure() {
        let error = WorkflowError::from(FlowTransitionError::NotConcluded);

        assert!(!error.is_retryable());
        assert!(matches!(
            ApplicationError::from(error),
            ApplicationError::Domain(DomainError::FlowTransition(FlowTransitionError::NotConcluded))
        ));
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_before_any_stage() {
        let h = harness();

        let error =
            h.orchestrator.handle_message(&ConversationId::new(), "   \n").await.unwrap_err();

        assert!(matches!(error, WorkflowError::EmptyPrompt));
        assert!(h.capability.calls().is_empty());
        assert!(matches!(
            ApplicationError::from(error),
            ApplicationError::Domain(DomainError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn stored_transcript_is_replayed_between_instruction_and_prompt() {
        let h = harness();
        let id = ConversationId::new();
        h.store.append_turn(&id, "Do you sell EVs?", "Yes, several!").await.expect("seed");

        h.capability.push_structured(
            DETECTION,
            json!({"known_next_step": "SAVE_CUSTOMER_INFO", "message": "Noted your email."}),
        );
        suggest(&h.capability, "A salesperson will reach out.");

        h.orchestrator.handle_message(&id, "my email is a@b.c").await.expect("reply");

        let calls = h.capability.calls();
        let messages = calls[0].context.messages();
        assert_eq!(messages[0].role, Role::Developer);
        assert_eq!((messages[1].role, messages[1].content.as_str()), (Role::User, "Do you sell EVs?"));
        assert_eq!((messages[2].role, messages[2].content.as_str()), (Role::Assistant, "Yes, several!"));
        assert_eq!(messages.len(), 4);
        assert_eq!(h.store.read(&id).await.expect("read").len(), 4);
    }

    #[tokio::test]
    async fn messages_for_one_conversation_are_serialized_in_submission_order() {
        let h = harness_with(
            ScriptedCapability::new().with_delay(Duration::from_millis(20)),
            StaticInventory::default(),
        );
        for reply in ["first reply", "second reply"] {
            no_next_step(&h.capability);
            h.capability.push_structured(RELEVANCE, json!({"stock_related": "NO", "message": reply}));
            suggest(&h.capability, reply);
        }

        let id = ConversationId::new();
        let (first, second) = tokio::join!(
            h.orchestrator.handle_message(&id, "first question"),
            h.orchestrator.handle_message(&id, "second question"),
        );
        assert_eq!(first.expect("first").message, "first reply");
        assert_eq!(second.expect("second").message, "second reply");

        let contents: Vec<String> = h
            .store
            .read(&id)
            .await
            .expect("read")
            .into_iter()
            .map(|entry| entry.content)
            .collect();
        assert_eq!(contents, vec!["first question", "first reply", "second question", "second reply"]);

        let detections: Vec<_> =
            h.capability.calls().into_iter().filter(|call| call.shape == Some(DETECTION)).collect();
        let second_context = detections[1].context.messages();
        assert!(second_context
            .iter()
            .any(|m| m.role == Role::Assistant && m.content == "first reply"));
        assert_eq!(h.orchestrator.active_conversations(), 0);
    }

    #[tokio::test]
    async fn slow_stage_times_out_as_retryable_capability_failure() {
        let capability = ScriptedCapability::new().with_delay(Duration::from_millis(200));
        let mut h = harness_with(capability, StaticInventory::default());
        h.orchestrator =
            WorkflowOrchestrator::new(h.capability.clone(), h.store.clone(), h.inventory.clone())
                .with_stage_timeout(Duration::from_millis(10));
        no_next_step(&h.capability);

        let id = ConversationId::new();
        let error = h.orchestrator.handle_message(&id, "hello").await.unwrap_err();

        assert!(matches!(
            error,
            WorkflowError::Capability { source: LlmError::Timeout { .. }, .. }
        ));
        assert!(error.is_retryable());
        assert!(matches!(ApplicationError::from(error), ApplicationError::Integration(_)));
        assert!(h.store.read(&id).await.expect("read").is_empty());
    }

    struct CorruptStore;

    #[async_trait]
    impl ConversationStore for CorruptStore {
        async fn append(
            &self,
            _id: &ConversationId,
            _sayer: Sayer,
            _content: &str,
        ) -> Result<(), RepositoryError> {
            Ok(())
        }

        async fn append_turn(
            &self,
            _id: &ConversationId,
            _utterance: &str,
            _reply: &str,
        ) -> Result<(), RepositoryError> {
            Ok(())
        }

        async fn read(&self, _id: &ConversationId) -> Result<Vec<StoredEntry>, RepositoryError> {
            Ok(vec![StoredEntry {
                timestamp: Utc::now(),
                sayer: "robot".to_string(),
                content: "beep".to_string(),
            }])
        }

        async fn clear(&self) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_sayer_in_store_aborts_before_any_stage() {
        let capability = Arc::new(ScriptedCapability::new());
        let orchestrator = WorkflowOrchestrator::new(
            capability.clone(),
            Arc::new(CorruptStore),
            Arc::new(StaticInventory::default()),
        );

        let error =
            orchestrator.handle_message(&ConversationId::new(), "hello").await.unwrap_err();

        assert!(matches!(
            error,
            WorkflowError::Context(ContextError::UnknownSayerTag(ref tag)) if tag == "robot"
        ));
        assert!(capability.calls().is_empty());
    }

    #[tokio::test]
    async fn end_conversation_returns_the_full_transcript() {
        let h = harness();
        let id = ConversationId::new();
        h.store.append_turn(&id, "hi", "hello!").await.expect("seed");

        let transcript = h.orchestrator.end_conversation(&id).await.expect("transcript");

        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].content, "hello!");
        assert_eq!(h.orchestrator.active_conversations(), 0);
    }
}

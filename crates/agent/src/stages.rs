use std::sync::Arc;

use serde::Deserialize;

use showroom_core::domain::conversation::{ConversationContext, Role};
use showroom_core::domain::inventory::{InventoryRow, INVENTORY_SCHEMA};
use showroom_core::domain::next_step::NextStepTag;

use crate::llm::{
    generate_structured, FieldKind, LanguageModelCapability, LlmError, OutputShape, ShapeField,
    StructuredJudgment,
};

const NEXT_STEP_TAGS: &[&str] = &NextStepTag::WIRE_NAMES;
const VERDICT_TAGS: &[&str] = &["YES", "NO"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Yes,
    No,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NextStepJudgment {
    pub known_next_step: Option<NextStepTag>,
    pub message: String,
}

impl StructuredJudgment for NextStepJudgment {
    const SHAPE: OutputShape = OutputShape {
        name: "next_step_detection",
        fields: &[
            ShapeField {
                name: "known_next_step",
                kind: FieldKind::Enum { values: NEXT_STEP_TAGS, nullable: true },
            },
            ShapeField { name: "message", kind: FieldKind::Text },
        ],
    };
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct StockRelevanceJudgment {
    pub stock_related: Verdict,
    pub message: String,
}

impl StructuredJudgment for StockRelevanceJudgment {
    const SHAPE: OutputShape = OutputShape {
        name: "stock_relevance",
        fields: &[
            ShapeField {
                name: "stock_related",
                kind: FieldKind::Enum { values: VERDICT_TAGS, nullable: false },
            },
            ShapeField { name: "message", kind: FieldKind::Text },
        ],
    };
}

/// `message` holds the candidate query text when `is_query` is `Yes`, and a
/// plain reply otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct QueryJudgment {
    pub is_query: Verdict,
    pub message: String,
}

impl StructuredJudgment for QueryJudgment {
    const SHAPE: OutputShape = OutputShape {
        name: "query_generation",
        fields: &[
            ShapeField {
                name: "is_query",
                kind: FieldKind::Enum { values: VERDICT_TAGS, nullable: false },
            },
            ShapeField { name: "message", kind: FieldKind::Text },
        ],
    };
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SuggestionJudgment {
    pub known_next_step: Option<NextStepTag>,
    pub message: String,
}

impl StructuredJudgment for SuggestionJudgment {
    const SHAPE: OutputShape = OutputShape {
        name: "next_step_suggestion",
        fields: &[
            ShapeField {
                name: "known_next_step",
                kind: FieldKind::Enum { values: NEXT_STEP_TAGS, nullable: true },
            },
            ShapeField { name: "message", kind: FieldKind::Text },
        ],
    };
}

/// Fresh per call: instruction first, then the prior transcript, then the prompt.
fn stage_context(
    instruction: &str,
    prior: &ConversationContext,
    prompt: &str,
) -> ConversationContext {
    let mut context = ConversationContext::seeded(instruction);
    context.merge(prior);
    context.add(Role::User, prompt);
    context
}

fn rows_as_json(rows: &[InventoryRow]) -> String {
    serde_json::to_string(rows).unwrap_or_else(|_| "[]".to_string())
}

pub struct NextStepDetector {
    capability: Arc<dyn LanguageModelCapability>,
}

impl NextStepDetector {
    pub const INSTRUCTION: &'static str = concat!(
        "You assist people who are looking to buy a car from our dealership ",
        "and you can answer questions about the cars we have in stock.\n",
        "Decide whether the buyer is asking for one of these follow-up actions:\n",
        "- TEST_DRIVE: book a test drive and collect the details needed to schedule it.\n",
        "- SAVE_CUSTOMER_INFO: keep the buyer's contact details so a salesperson can follow up.\n",
        "- UPDATE_CRM: the buyer does not want to be contacted and their record must say so.\n",
        "If none of these applies, known_next_step is null and the conversation simply goes on.\n",
        "Answer as JSON {known_next_step: tag or null, message: confirmation that the step ",
        "is being handled, or a reply that keeps the conversation going}."
    );

    pub fn new(capability: Arc<dyn LanguageModelCapability>) -> Self {
        Self { capability }
    }

    pub fn prompt_for(utterance: &str) -> String {
        format!("detect the step the user wants to take from this message: {utterance}")
    }

    pub async fn run(
        &self,
        utterance: &str,
        prior: &ConversationContext,
    ) -> Result<NextStepJudgment, LlmError> {
        let context = stage_context(Self::INSTRUCTION, prior, &Self::prompt_for(utterance));
        generate_structured(self.capability.as_ref(), &context).await
    }
}

pub struct DependenciesIdentifier {
    capability: Arc<dyn LanguageModelCapability>,
}

impl DependenciesIdentifier {
    pub const INSTRUCTION: &'static str = concat!(
        "You assist people who are looking to buy a car from our dealership ",
        "and you can answer questions about the cars we have in stock.\n",
        "Decide whether answering the message needs knowledge of the current stock ",
        "or whether it is a general question you can answer directly.\n",
        "Answer as JSON {stock_related: YES or NO, message: your answer to the message}."
    );

    pub fn new(capability: Arc<dyn LanguageModelCapability>) -> Self {
        Self { capability }
    }

    pub async fn run(
        &self,
        utterance: &str,
        prior: &ConversationContext,
    ) -> Result<StockRelevanceJudgment, LlmError> {
        let context = stage_context(Self::INSTRUCTION, prior, utterance);
        generate_structured(self.capability.as_ref(), &context).await
    }
}

pub struct SqlGenerator {
    capability: Arc<dyn LanguageModelCapability>,
}

impl SqlGenerator {
    pub const INSTRUCTION: &'static str = concat!(
        "You assist people who are looking to buy a car from our dealership ",
        "and you can answer questions about the cars we have in stock.\n",
        "Offer choices and steer the buyer towards a purchase. Do not assume constraints ",
        "the buyer did not state, they only narrow the selection.\n",
        "1. Decide whether the request can be expressed as one SQL query that starts with ",
        "SELECT and searches the cars table. Nothing else is acceptable.\n",
        "2. If it can, map the request onto the schema and sample rows you are given.\n",
        "3. Keep filters meaningful and prefer LIKE over = when comparing text.\n",
        "Answer as JSON {is_query: YES or NO, message: the bare SQL query without code ",
        "fences when is_query is YES, otherwise your answer to the request}."
    );

    pub fn new(capability: Arc<dyn LanguageModelCapability>) -> Self {
        Self { capability }
    }

    pub fn prompt_for(utterance: &str, sample: &[InventoryRow]) -> String {
        format!(
            "given this schema {INVENTORY_SCHEMA}\nand these sample rows {}\n\
             respond with only the SQL query that answers this request.\nthe request: {utterance}",
            rows_as_json(sample)
        )
    }

    pub async fn run(
        &self,
        utterance: &str,
        sample: &[InventoryRow],
        prior: &ConversationContext,
    ) -> Result<QueryJudgment, LlmError> {
        let context = stage_context(Self::INSTRUCTION, prior, &Self::prompt_for(utterance, sample));
        generate_structured(self.capability.as_ref(), &context).await
    }
}

pub struct SqlToHuman {
    capability: Arc<dyn LanguageModelCapability>,
}

impl SqlToHuman {
    pub const INSTRUCTION: &'static str = concat!(
        "You assist people who are looking to buy a car from our dealership ",
        "and you can answer questions about the cars we have in stock.\n",
        "You receive rows returned by a database query. Turn them into a clear answer ",
        "for the buyer with the details they need. Never mention SQL in your answer."
    );

    pub fn new(capability: Arc<dyn LanguageModelCapability>) -> Self {
        Self { capability }
    }

    pub fn prompt_for(rows: &[InventoryRow], query: &str) -> String {
        format!(
            "reformulate the results {} of running this query {query} for a human reader",
            rows_as_json(rows)
        )
    }

    pub async fn run(
        &self,
        rows: &[InventoryRow],
        query: &str,
        prior: &ConversationContext,
    ) -> Result<String, LlmError> {
        let context = stage_context(Self::INSTRUCTION, prior, &Self::prompt_for(rows, query));
        self.capability.generate_text(&context).await
    }
}

pub struct NextStepSuggestor {
    capability: Arc<dyn LanguageModelCapability>,
}

impl NextStepSuggestor {
    pub const INSTRUCTION: &'static str = concat!(
        "You assist people who are looking to buy a car from our dealership ",
        "and you can answer questions about the cars we have in stock.\n",
        "Based on the conversation, suggest one of these follow-up actions:\n",
        "- TEST_DRIVE: book a test drive and collect the details needed to schedule it.\n",
        "- SAVE_CUSTOMER_INFO: keep the buyer's contact details so a salesperson can follow up.\n",
        "- UPDATE_CRM: the buyer does not want to be contacted and their record must say so.\n",
        "Or keep the conversation going while encouraging a purchase, with no tag.\n",
        "Ask for whatever the suggested step needs. Be cheerful and welcoming.\n",
        "Answer as JSON {known_next_step: tag or null, message: the response you were given ",
        "followed by two empty lines and your suggestion}."
    );

    pub fn new(capability: Arc<dyn LanguageModelCapability>) -> Self {
        Self { capability }
    }

    pub fn prompt_for(carry: &str) -> String {
        format!("suggest the next step after this response: {carry}")
    }

    pub async fn run(
        &self,
        carry: &str,
        prior: &ConversationContext,
    ) -> Result<SuggestionJudgment, LlmError> {
        let context = stage_context(Self::INSTRUCTION, prior, &Self::prompt_for(carry));
        generate_structured(self.capability.as_ref(), &context).await
    }
}

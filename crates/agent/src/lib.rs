//! Conversation workflow for the showroom assistant.
//!
//! Every buyer message runs through a fixed pipeline of model-backed stages.
//! Each stage owns one instruction and one output shape, and its judgment can
//! conclude the branch early:
//!
//! 1. **Next-step detection** (`stages::NextStepDetector`): the buyer asked for
//!    a test drive, a follow-up, or to be left alone.
//! 2. **Stock relevance** (`stages::DependenciesIdentifier`): general questions
//!    are answered without touching the inventory.
//! 3. **Query generation and execution** (`stages::SqlGenerator`,
//!    `stages::SqlToHuman`): inventory questions become a read-only query whose
//!    rows are rephrased for the buyer.
//! 4. **Suggestion** (`stages::NextStepSuggestor`): always runs last and
//!    produces the reply.
//!
//! The model never touches the database directly. Generated query text is
//! checked and executed by the inventory repository, read-only.

pub mod llm;
pub mod openai;
pub mod orchestrator;
pub mod stages;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use llm::{generate_structured, LanguageModelCapability, LlmError, OutputShape};
pub use openai::OpenAiCompatibleClient;
pub use orchestrator::{WorkflowError, WorkflowOrchestrator, WorkflowReply};

//! HTTP surface over the workflow orchestrator.
//!
//! Handlers stay thin: they parse the conversation id and request body, hand
//! the turn to the orchestrator, and map failures onto the interface error
//! layer so callers only ever see a user-safe message and a correlation id.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use showroom_agent::{WorkflowError, WorkflowOrchestrator};
use showroom_core::domain::conversation::{ConversationId, StoredEntry};
use showroom_core::errors::{ApplicationError, InterfaceError};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ChatState {
    orchestrator: Arc<WorkflowOrchestrator>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub uuid: ConversationId,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AskResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn bad_request(message: impl Into<String>, correlation_id: String) -> Self {
        Self(InterfaceError::BadRequest { message: message.into(), correlation_id })
    }

    fn from_workflow(error: WorkflowError, correlation_id: String) -> Self {
        Self(ApplicationError::from(error).into_interface(correlation_id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(
                event_name = "server.chat.request_failed",
                correlation_id = self.0.correlation_id(),
                retryable = self.0.is_retryable(),
                error = %self.0,
                "chat request failed"
            );
        } else {
            warn!(
                event_name = "server.chat.request_rejected",
                correlation_id = self.0.correlation_id(),
                error = %self.0,
                "chat request rejected"
            );
        }

        let body = ErrorBody {
            error: self.0.user_message().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(orchestrator: Arc<WorkflowOrchestrator>) -> Router {
    Router::new()
        .route("/ask", post(start_discussion))
        .route("/ask/{uuid}", post(ask).get(transcript).delete(end_discussion))
        .with_state(ChatState { orchestrator })
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn parse_conversation_id(raw: &str, correlation_id: &str) -> Result<ConversationId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request(format!("`{raw}` is not a conversation id"), correlation_id.into())
    })
}

pub async fn start_discussion() -> Json<StartResponse> {
    let uuid = ConversationId::new();
    info!(
        event_name = "server.chat.discussion_started",
        conversation_id = %uuid,
        "discussion started"
    );
    Json(StartResponse { uuid })
}

pub async fn ask(
    State(state): State<ChatState>,
    Path(raw_id): Path<String>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, ApiError> {
    let correlation_id = correlation_id();
    let conversation_id = parse_conversation_id(&raw_id, &correlation_id)?;
    let Json(request) = body.map_err(|rejection| {
        ApiError::bad_request(rejection.body_text(), correlation_id.clone())
    })?;

    let reply = state
        .orchestrator
        .handle_message(&conversation_id, &request.prompt)
        .await
        .map_err(|error| ApiError::from_workflow(error, correlation_id.clone()))?;

    info!(
        event_name = "server.chat.reply_sent",
        correlation_id = %correlation_id,
        conversation_id = %conversation_id,
        branch = reply.outcome.label(),
        "reply sent"
    );
    Ok(Json(AskResponse { message: reply.message }))
}

pub async fn transcript(
    State(state): State<ChatState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Vec<StoredEntry>>, ApiError> {
    let correlation_id = correlation_id();
    let conversation_id = parse_conversation_id(&raw_id, &correlation_id)?;

    let entries = state
        .orchestrator
        .transcript(&conversation_id)
        .await
        .map_err(|error| ApiError::from_workflow(error, correlation_id))?;
    Ok(Json(entries))
}

pub async fn end_discussion(
    State(state): State<ChatState>,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let correlation_id = correlation_id();
    let conversation_id = parse_conversation_id(&raw_id, &correlation_id)?;

    let entries = state
        .orchestrator
        .end_conversation(&conversation_id)
        .await
        .map_err(|error| ApiError::from_workflow(error, correlation_id.clone()))?;

    // Sales staff pick the conversation up from this event.
    info!(
        event_name = "server.chat.handoff",
        correlation_id = %correlation_id,
        conversation_id = %conversation_id,
        entry_count = entries.len(),
        transcript = %serde_json::to_string(&entries).unwrap_or_default(),
        "conversation handed off to sales"
    );
    Ok(StatusCode::NO_CONTENT)
}

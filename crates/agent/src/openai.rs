//! OpenAI-compatible chat completions client.
//!
//! Works against any endpoint that speaks the `/chat/completions` protocol,
//! which covers both OpenAI and a local Ollama server.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use showroom_core::config::{LlmConfig, LlmProvider};
use showroom_core::domain::conversation::ConversationContext;

use crate::llm::{LanguageModelCapability, LlmError, OutputShape};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    temperature: f32,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| LlmError::Unavailable(format!("http client: {error}")))?;

        let base_url = config.base_url.clone().unwrap_or_else(|| match config.provider {
            LlmProvider::OpenAi => OPENAI_BASE_URL.to_string(),
            LlmProvider::Ollama => OLLAMA_BASE_URL.to_string(),
        });

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, context: &ConversationContext, shape: Option<&OutputShape>) -> Value {
        let messages: Vec<Value> = context
            .messages()
            .iter()
            .map(|message| json!({ "role": message.role.as_str(), "content": message.content }))
            .collect();

        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages,
        });

        if let Some(shape) = shape {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": shape.name,
                    "strict": true,
                    "schema": shape.to_json_schema(),
                },
            });
        }

        body
    }

    async fn complete(&self, body: Value) -> Result<Option<String>, LlmError> {
        let mut request = self.http.post(format!("{}/chat/completions", self.base_url)).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|error| self.transport_error(error))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!("provider returned {status}: {text}")));
        }

        let completion: ChatCompletion =
            response.json().await.map_err(|error| self.transport_error(error))?;
        Ok(first_content(completion))
    }

    fn transport_error(&self, error: reqwest::Error) -> LlmError {
        if error.is_timeout() {
            LlmError::Timeout { after: self.timeout }
        } else {
            LlmError::Unavailable(error.to_string())
        }
    }
}

fn first_content(completion: ChatCompletion) -> Option<String> {
    completion.choices.into_iter().next().and_then(|choice| choice.message.content)
}

#[async_trait]
impl LanguageModelCapability for OpenAiCompatibleClient {
    async fn generate_text(&self, context: &ConversationContext) -> Result<String, LlmError> {
        let content = self.complete(self.request_body(context, None)).await?;
        Ok(content.unwrap_or_default())
    }

    async fn generate_structured_value(
        &self,
        context: &ConversationContext,
        shape: &OutputShape,
    ) -> Result<Value, LlmError> {
        let content = self
            .complete(self.request_body(context, Some(shape)))
            .await?
            .ok_or_else(|| LlmError::schema_violation(shape, "provider returned no content"))?;

        debug!(
            event_name = "agent.llm.structured_response",
            shape = shape.name,
            length = content.len(),
            "structured response received"
        );

        serde_json::from_str(&content)
            .map_err(|error| LlmError::schema_violation(shape, format!("invalid JSON: {error}")))
    }
}

use std::time::Duration;

use async_openai::types::chat::{
    ChatCompletionRequestUserMessage, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use schemars::schema_for;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{configs::LlmConfig, prompts::BatchReply};

/// Status recorded for a round that got a usable reply.
pub const STATUS_OK: u16 = 200;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("LLM request could not be built: {0}")]
    InvalidRequest(String),

    #[error("LLM request failed: {0}")]
    Network(String),

    #[error("LLM API error: {0}")]
    Status(u16),

    #[error("LLM reply could not be decoded: {0}")]
    Decode(String),

    #[error("LLM returned no message content")]
    EmptyResponse,
}

impl TransportError {
    /// Status the batch engine records for this failure; 0 when no HTTP status was seen.
    pub fn status_code(&self) -> u16 {
        match self {
            TransportError::Status(code) => *code,
            TransportError::EmptyResponse => STATUS_OK,
            TransportError::InvalidRequest(_)
            | TransportError::Network(_)
            | TransportError::Decode(_) => 0,
        }
    }
}

/// JSON Schema attached to a request to ask for structured output.
#[derive(Debug, Clone)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl ResponseSchema {
    pub fn batch_reply() -> Self {
        Self {
            name: "batch_translations".into(),
            schema: schema_for!(BatchReply).to_value(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatPrompt {
    pub text: String,
    pub response_schema: Option<ResponseSchema>,
}

impl ChatPrompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            response_schema: None,
        }
    }

    pub fn with_schema(mut self, schema: ResponseSchema) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// One user-message chat completion against the language model.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, prompt: &ChatPrompt) -> Result<String, TransportError>;
}

#[derive(serde::Deserialize)]
struct CompletionReply {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(serde::Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(serde::Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

fn first_content(reply: CompletionReply) -> Result<String, TransportError> {
    reply
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.is_empty())
        .ok_or(TransportError::EmptyResponse)
}

/// Transport for OpenAI-compatible `/chat/completions` endpoints (LM Studio, vLLM, OpenAI).
///
/// Requests are sent directly rather than through `async_openai::Client` so the
/// HTTP status of every attempt is visible; rate limiting is detected from it.
#[derive(Clone)]
pub struct OpenAiTransport {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiTransport {
    pub fn new(config: &LlmConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            model: config.model.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(&self, prompt: &ChatPrompt) -> Result<CreateChatCompletionRequest, TransportError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages([ChatCompletionRequestUserMessage::from(prompt.text.as_str()).into()]);

        if let Some(schema) = &prompt.response_schema {
            args.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: schema.name.clone(),
                    schema: Some(schema.schema.clone()),
                    strict: Some(true),
                },
            });
        }

        args.build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))
    }
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn complete(&self, prompt: &ChatPrompt) -> Result<String, TransportError> {
        let request = self.build_request(prompt)?;

        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), endpoint = %self.endpoint, "LLM API error");
            return Err(TransportError::Status(status.as_u16()));
        }

        let reply: CompletionReply = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        let content = first_content(reply)?;
        debug!(reply = %content, "LLM raw reply");
        Ok(content)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::VecDeque, sync::Mutex};

    use super::*;

    /// Replays canned replies in order and records every prompt it was sent.
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<String, TransportError>>>,
        prompts: Mutex<Vec<ChatPrompt>>,
    }

    impl ScriptedTransport {
        pub fn new(replies: Vec<Result<String, TransportError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn replying(replies: &[&str]) -> Self {
            Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.text.clone())
                .collect()
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        pub fn schemas(&self) -> Vec<Option<String>> {
            self.prompts
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.response_schema.as_ref().map(|s| s.name.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn complete(&self, prompt: &ChatPrompt) -> Result<String, TransportError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Network("script exhausted".into())))
        }
    }
}

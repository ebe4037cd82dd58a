use std::sync::Arc;

use async_trait::async_trait;
use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::ChatMessage;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use labeler_core::{AuthMode, Error, ReasoningEffort, Result, Settings, Verbosity};

use crate::session::SessionManager;
use crate::stream::{conversation_text, decode_stream};

/// Upstream error bodies are cut to this many characters.
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Verbosity>,
}

impl ModelRequest {
    /// Single user turn carrying `prompt`, tuned by `settings`.
    pub fn from_prompt(settings: &Settings, prompt: impl Into<String>) -> Self {
        Self {
            model: settings.model.clone(),
            messages: vec![Message::user(prompt)],
            temperature: settings.temperature,
            reasoning_effort: settings.reasoning_effort,
            verbosity: settings.verbosity,
        }
    }

    fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Something that turns a model request into the model's raw text answer.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn submit(&self, request: &ModelRequest) -> Result<String>;
}

pub(crate) fn transport_error(e: reqwest::Error) -> Error {
    Error::Transport {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

pub(crate) fn upstream_error(status: StatusCode, body: &str) -> Error {
    let body = body.trim();
    let message = if body.chars().count() > MAX_ERROR_BODY {
        let cut: String = body.chars().take(MAX_ERROR_BODY).collect();
        format!("{cut}...")
    } else if body.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body.to_string()
    };
    Error::Transport {
        status: Some(status.as_u16()),
        message,
    }
}

// --- API key backend ---

/// Direct completion API through the `llm` client.
pub struct ApiKeyBackend {
    api_key: String,
    base_url: Option<String>,
    service_tier: Option<String>,
    timeout_secs: u64,
}

impl ApiKeyBackend {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if settings.api_key.trim().is_empty() {
            return Err(Error::Config("API key is not set".to_string()));
        }
        Ok(Self {
            api_key: settings.api_key.clone(),
            base_url: settings.api_base_url.clone().filter(|u| !u.is_empty()),
            service_tier: settings.service_tier.clone(),
            timeout_secs: settings.timeout_secs,
        })
    }
}

fn map_effort(effort: ReasoningEffort) -> llm::chat::ReasoningEffort {
    match effort {
        ReasoningEffort::Low => llm::chat::ReasoningEffort::Low,
        ReasoningEffort::Medium => llm::chat::ReasoningEffort::Medium,
        ReasoningEffort::High => llm::chat::ReasoningEffort::High,
    }
}

#[async_trait]
impl CompletionBackend for ApiKeyBackend {
    async fn submit(&self, request: &ModelRequest) -> Result<String> {
        if request.verbosity.is_some() || self.service_tier.is_some() {
            tracing::debug!(
                target: "labeler::engine",
                verbosity = ?request.verbosity,
                service_tier = ?self.service_tier,
                "verbosity and service tier are not supported by this backend, not sent"
            );
        }

        let mut builder = LLMBuilder::new()
            .backend(LLMBackend::OpenAI)
            .model(&request.model)
            .api_key(&self.api_key)
            .timeout_seconds(self.timeout_secs);

        if let Some(url) = &self.base_url {
            builder = builder.base_url(url);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(effort) = request.reasoning_effort {
            builder = builder.reasoning_effort(map_effort(effort));
        }

        let llm = builder
            .build()
            .map_err(|e| Error::Llm(format!("build LLM: {e}")))?;

        let messages: Vec<ChatMessage> = request
            .messages
            .iter()
            .map(|m| ChatMessage::user().content(m.content.as_str()).build())
            .collect();

        let response = llm
            .chat(&messages)
            .await
            .map_err(|e| Error::Llm(format!("chat: {e}")))?;

        match response.text() {
            Some(text) if !text.trim().is_empty() => Ok(text),
            Some(_) => Err(Error::Llm("model returned empty text".to_string())),
            None => Err(Error::Llm("model returned no text".to_string())),
        }
    }
}

// --- Session backend ---

/// Chat backend authenticated with the session manager's token. Answers
/// arrive as a server-sent event stream.
pub struct ChatBackend {
    client: reqwest::Client,
    conversation_url: String,
    sessions: Arc<SessionManager>,
}

impl ChatBackend {
    pub fn new(
        client: reqwest::Client,
        conversation_url: impl Into<String>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            client,
            conversation_url: conversation_url.into(),
            sessions,
        }
    }

    fn conversation_body(request: &ModelRequest) -> serde_json::Value {
        json!({
            "action": "next",
            "messages": [{
                "id": uuid::Uuid::new_v4().to_string(),
                "author": { "role": "user" },
                "content": {
                    "content_type": "text",
                    "parts": [request.user_text()],
                },
            }],
            "model": request.model,
            "parent_message_id": uuid::Uuid::new_v4().to_string(),
        })
    }
}

#[async_trait]
impl CompletionBackend for ChatBackend {
    async fn submit(&self, request: &ModelRequest) -> Result<String> {
        let token = self.sessions.token().await?;

        let resp = self
            .client
            .post(&self.conversation_url)
            .bearer_auth(&token)
            .header(ACCEPT, "text/event-stream")
            .json(&Self::conversation_body(request))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            self.sessions.invalidate(&token).await;
            return Err(Error::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(target: "labeler::engine", status = status.as_u16(), "chat backend rejected request");
            return Err(upstream_error(status, &body));
        }

        decode_stream(resp.bytes_stream(), conversation_text).await
    }
}

// --- Gateway ---

/// The backend a request goes through, chosen by auth mode.
pub enum Gateway {
    ApiKey(ApiKeyBackend),
    Session(ChatBackend),
}

impl Gateway {
    pub fn from_settings(
        settings: &Settings,
        client: &reqwest::Client,
        sessions: &Arc<SessionManager>,
        auth_mode: AuthMode,
    ) -> Result<Self> {
        match auth_mode {
            AuthMode::ApiKey => Ok(Gateway::ApiKey(ApiKeyBackend::from_settings(settings)?)),
            AuthMode::Session => {
                if settings.session.conversation_url.trim().is_empty() {
                    return Err(Error::Config("conversation URL is not set".to_string()));
                }
                Ok(Gateway::Session(ChatBackend::new(
                    client.clone(),
                    settings.session.conversation_url.clone(),
                    sessions.clone(),
                )))
            }
        }
    }

    pub fn auth_mode(&self) -> AuthMode {
        match self {
            Gateway::ApiKey(_) => AuthMode::ApiKey,
            Gateway::Session(_) => AuthMode::Session,
        }
    }
}

#[async_trait]
impl CompletionBackend for Gateway {
    async fn submit(&self, request: &ModelRequest) -> Result<String> {
        match self {
            Gateway::ApiKey(backend) => backend.submit(request).await,
            Gateway::Session(backend) => backend.submit(request).await,
        }
    }
}

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::api_client::{ApiClient, AuthMethod};
use super::errors::ProviderError;
use crate::config::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One fully-assembled chat completion request. The system preamble always
/// comes first, then the conversation history, then the prompt as the final
/// user turn.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: String,
    pub history: Vec<ChatMessage>,
    pub prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub response_format_json: bool,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;

    fn model_name(&self) -> &str;
}

/// Provider for any OpenAI-compatible `/chat/completions` endpoint. The
/// production deployments sit behind such gateways regardless of the actual
/// model vendor.
pub struct OpenAiCompatProvider {
    api: ApiClient,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatProvider {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api = ApiClient::with_timeout(
            settings.llm_base_url.clone(),
            AuthMethod::BearerToken(settings.llm_api_key.clone()),
            Duration::from_secs(settings.llm_timeout_seconds),
        )?;
        Ok(Self {
            api,
            model: settings.llm_model.clone(),
            temperature: settings.llm_temperature,
            max_tokens: settings.llm_max_tokens,
        })
    }

    fn build_payload(&self, request: &CompletionRequest, response_format: bool) -> Value {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(json!({"role": "system", "content": request.system}));
        for message in &request.history {
            messages.push(json!({"role": message.role.as_str(), "content": message.content}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut payload = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "temperature": request.temperature.unwrap_or(self.temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
        });
        if response_format {
            payload["response_format"] = json!({"type": "json_object"});
        }
        payload
    }

    async fn post_completion(&self, payload: &Value) -> Result<String, ProviderError> {
        let response = self.api.api_post("chat/completions", payload).await?;

        let status = response.status;
        let body = response.payload.unwrap_or(Value::Null);

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Authentication(format!(
                "upstream returned {}",
                status
            )));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimitExceeded(truncate_body(&body)));
        }
        if status.is_server_error() {
            return Err(ProviderError::ServerError(truncate_body(&body)));
        }
        if !status.is_success() {
            return Err(ProviderError::RequestFailed(format!(
                "status {}: {}",
                status,
                truncate_body(&body)
            )));
        }

        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProviderError::MalformedResponse(format!(
                    "missing choices[0].message.content: {}",
                    truncate_body(&body)
                ))
            })?;

        Ok(unwrap_nested_json(content))
    }
}

/// Some gateways wrap the JSON object we asked for in a string of their own.
/// If the content itself parses as JSON, re-serialize it canonically so
/// downstream parsing sees a clean object.
fn unwrap_nested_json(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if let Ok(serialized) = serde_json::to_string(&value) {
                return serialized;
            }
        }
    }
    content.to_string()
}

fn truncate_body(body: &Value) -> String {
    let text = body.to_string();
    if text.chars().count() <= 400 {
        return text;
    }
    let mut truncated: String = text.chars().take(400).collect();
    truncated.push('…');
    truncated
}

fn looks_like_response_format_rejection(error: &ProviderError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("response_format")
        || message.contains("not support")
        || message.contains("unsupported")
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let payload = self.build_payload(request, request.response_format_json);

        match self.post_completion(&payload).await {
            Ok(content) => Ok(content),
            Err(error)
                if request.response_format_json
                    && looks_like_response_format_rejection(&error) =>
            {
                // Same attempt, parameter dropped: some proxies reject
                // response_format outright.
                tracing::warn!(
                    "upstream rejected response_format, retrying without it: {}",
                    error
                );
                let fallback = self.build_payload(request, false);
                self.post_completion(&fallback).await
            }
            Err(error) => Err(error),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

//! Image generation through an OpenAI-compatible chat endpoint whose reply
//! text carries the produced image URL.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::Settings;
use crate::providers::errors::ProviderError;

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Produce raw generator output for a prompt; the caller extracts the
    /// image URL from it.
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

pub struct OneApiImageClient {
    client_first: reqwest::Client,
    client_retry: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OneApiImageClient {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let connect = Duration::from_secs(settings.image_connect_timeout_seconds);
        // The first attempt gets the generous read budget; retries use the
        // tighter one so a stuck upstream cannot pin a worker for minutes.
        let client_first = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(Duration::from_secs(settings.image_first_read_timeout_seconds))
            .build()?;
        let client_retry = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(Duration::from_secs(settings.image_retry_read_timeout_seconds))
            .build()?;

        Ok(Self {
            client_first,
            client_retry,
            endpoint: settings.image_base_url.clone(),
            api_key: settings.image_api_key.clone(),
            model: settings.image_model.clone(),
            max_retries: settings.image_max_retries,
        })
    }

    fn payload(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [{
                    "type": "text",
                    "text": format!("Generate an image based on this prompt: {prompt}"),
                }],
            }],
            "max_tokens": 4096,
            "temperature": 0.7,
        })
    }

    async fn attempt(&self, prompt: &str, first: bool) -> Result<String, ProviderError> {
        let client = if first {
            &self.client_first
        } else {
            &self.client_retry
        };

        let response = client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.payload(prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::RequestFailed(format!(
                "image endpoint returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::MalformedResponse("image response missing content".into())
            })
    }
}

#[async_trait]
impl ImageGenerator for OneApiImageClient {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let max_attempts = self.max_retries + 1;
        let mut last_error = ProviderError::RequestFailed("no attempts made".into());

        for attempt in 1..=max_attempts {
            match self.attempt(prompt, attempt == 1).await {
                Ok(content) => return Ok(content),
                Err(error) => {
                    tracing::warn!(attempt, max_attempts, %error, "image generation attempt failed");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }
}

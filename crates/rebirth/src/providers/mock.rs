//! Scripted chat provider for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::chat::{ChatProvider, CompletionRequest};
use super::errors::ProviderError;

pub struct MockChatProvider {
    responses: Mutex<Vec<Result<String, ProviderError>>>,
    default_response: Option<String>,
    fallback: Option<ProviderError>,
    calls: AtomicUsize,
}

impl MockChatProvider {
    /// Responses are served in order; once exhausted, further calls fail
    /// with `ServerError`.
    pub fn scripted(responses: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            default_response: None,
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_err(error: ProviderError) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            default_response: None,
            fallback: Some(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_ok(content: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            default_response: Some(content.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if let Some(next) = (!responses.is_empty()).then(|| responses.remove(0)) {
            return next;
        }
        if let Some(default) = &self.default_response {
            return Ok(default.clone());
        }
        Err(self
            .fallback
            .clone()
            .unwrap_or_else(|| ProviderError::ServerError("mock script exhausted".into())))
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }
}

//! LLM adapter: a retrying, metered front over a [`ChatProvider`].
//!
//! Every call goes out with a strict JSON-only system preamble (callers
//! override it per prompt family), is retried with randomized backoff, and
//! feeds the process-wide metrics surfaced at `/story/metrics`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;

use super::chat::{ChatMessage, ChatProvider, CompletionRequest};
use super::errors::ProviderError;
use crate::config::Settings;

/// Fallback system preamble. The engine overrides this for every prompt
/// family; it exists so ad-hoc calls (moderation, repair) still get the
/// JSON-or-plain-text discipline the gateways expect.
const DEFAULT_SYSTEM_PREAMBLE: &str = "你是一个专用于生成游戏剧情的AI。\
当要求输出JSON时，必须只输出一个语法严格正确的JSON对象，禁止任何JSON之外的文本、注释或Markdown标记。";

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_override: Option<String>,
}

#[derive(Debug, Default)]
struct LlmMetrics {
    calls_total: u64,
    retries_total: u64,
    failures_total: u64,
    total_latency_ms: f64,
    latency_count: u64,
    last_latency_ms: f64,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMetricsSnapshot {
    pub model: String,
    pub calls_total: u64,
    pub retries_total: u64,
    pub failures_total: u64,
    pub last_latency_ms: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub last_error: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl RetryConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let min = settings.llm_retry_backoff_min_ms;
        let max = settings.llm_retry_backoff_max_ms.max(min);
        Self {
            max_retries: settings.llm_max_retries,
            backoff_min: Duration::from_millis(min),
            backoff_max: Duration::from_millis(max),
        }
    }
}

pub struct LlmClient {
    provider: Arc<dyn ChatProvider>,
    retry: RetryConfig,
    response_format_json: bool,
    timeout_seconds: u64,
    metrics: Mutex<LlmMetrics>,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn ChatProvider>, settings: &Settings) -> Self {
        Self {
            provider,
            retry: RetryConfig::from_settings(settings),
            response_format_json: settings.llm_response_format_json,
            timeout_seconds: settings.llm_timeout_seconds,
            metrics: Mutex::new(LlmMetrics::default()),
        }
    }

    /// Generate a single completion. Retries up to `max_retries` additional
    /// attempts on any provider error, sleeping a uniformly random interval
    /// in `[backoff_min, backoff_max]` between attempts. Exhausted retries
    /// surface as [`ProviderError::Unavailable`].
    pub async fn generate(
        &self,
        prompt: &str,
        history: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<String, ProviderError> {
        let request = CompletionRequest {
            system: options
                .system_override
                .unwrap_or_else(|| DEFAULT_SYSTEM_PREAMBLE.to_string()),
            history: history.to_vec(),
            prompt: prompt.to_string(),
            model: options.model,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format_json: self.response_format_json,
        };

        let max_attempts = self.retry.max_retries + 1;
        let mut last_error: Option<ProviderError> = None;

        for attempt in 1..=max_attempts {
            let start = Instant::now();
            match self.provider.complete(&request).await {
                Ok(content) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    let mut metrics = self.metrics.lock().unwrap();
                    metrics.calls_total += 1;
                    metrics.last_latency_ms = latency_ms;
                    metrics.total_latency_ms += latency_ms;
                    metrics.latency_count += 1;
                    metrics.last_error = None;
                    return Ok(content);
                }
                Err(error) => {
                    tracing::warn!(attempt, max_attempts, %error, "LLM attempt failed");
                    if attempt >= max_attempts {
                        let mut metrics = self.metrics.lock().unwrap();
                        metrics.failures_total += 1;
                        metrics.last_error = Some(error.to_string());
                        return Err(ProviderError::Unavailable {
                            attempts: max_attempts,
                            last_error: error.to_string(),
                        });
                    }
                    self.metrics.lock().unwrap().retries_total += 1;
                    last_error = Some(error);

                    let delay = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(self.retry.backoff_min..=self.retry.backoff_max)
                    };
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // Unreachable: the loop always returns on the final attempt.
        Err(last_error.unwrap_or(ProviderError::Unavailable {
            attempts: max_attempts,
            last_error: "unknown".into(),
        }))
    }

    pub fn metrics_snapshot(&self) -> LlmMetricsSnapshot {
        let metrics = self.metrics.lock().unwrap();
        let avg = if metrics.latency_count > 0 {
            Some((metrics.total_latency_ms / metrics.latency_count as f64 * 100.0).round() / 100.0)
        } else {
            None
        };
        LlmMetricsSnapshot {
            model: self.provider.model_name().to_string(),
            calls_total: metrics.calls_total,
            retries_total: metrics.retries_total,
            failures_total: metrics.failures_total,
            last_latency_ms: (metrics.latency_count > 0)
                .then(|| (metrics.last_latency_ms * 100.0).round() / 100.0),
            avg_latency_ms: avg,
            last_error: metrics.last_error.clone(),
            timeout_seconds: self.timeout_seconds,
            max_retries: self.retry.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockChatProvider;

    fn quick_settings() -> Settings {
        let mut settings = Settings::from_env();
        settings.llm_max_retries = 2;
        settings.llm_retry_backoff_min_ms = 1;
        settings.llm_retry_backoff_max_ms = 2;
        settings
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let provider = Arc::new(MockChatProvider::scripted(vec![
            Err(ProviderError::ServerError("boom".into())),
            Ok("{\"ok\":true}".into()),
        ]));
        let client = LlmClient::new(provider.clone(), &quick_settings());

        let out = client
            .generate("hi", &[], GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "{\"ok\":true}");

        let snapshot = client.metrics_snapshot();
        assert_eq!(snapshot.calls_total, 1);
        assert_eq!(snapshot.retries_total, 1);
        assert_eq!(snapshot.failures_total, 0);
        assert!(snapshot.avg_latency_ms.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_become_unavailable() {
        let provider = Arc::new(MockChatProvider::always_err(ProviderError::NetworkError(
            "down".into(),
        )));
        let client = LlmClient::new(provider.clone(), &quick_settings());

        let err = client
            .generate("hi", &[], GenerateOptions::default())
            .await
            .unwrap_err();
        match err {
            ProviderError::Unavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Unavailable, got {other:?}"),
        }

        let snapshot = client.metrics_snapshot();
        assert_eq!(snapshot.calls_total, 0);
        assert_eq!(snapshot.retries_total, 2);
        assert_eq!(snapshot.failures_total, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("Network error: down"));
    }
}

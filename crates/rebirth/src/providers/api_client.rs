use std::time::Duration;

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::Value;

/// Thin wrapper around `reqwest` for JSON APIs that authenticate with a
/// bearer token. Providers own one of these per upstream host.
pub struct ApiClient {
    client: Client,
    host: String,
    auth: AuthMethod,
}

pub enum AuthMethod {
    BearerToken(String),
    None,
}

pub struct ApiResponse {
    pub status: StatusCode,
    pub payload: Option<Value>,
}

impl ApiClient {
    pub fn new(host: impl Into<String>, auth: AuthMethod) -> Result<Self> {
        Self::with_timeout(host, auth, Duration::from_secs(600))
    }

    pub fn with_timeout(
        host: impl Into<String>,
        auth: AuthMethod,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            host: host.into(),
            auth,
        })
    }

    fn build_url(&self, path: &str) -> Result<url::Url> {
        let mut base = url::Url::parse(&self.host)
            .map_err(|e| anyhow::anyhow!("Invalid base URL '{}': {}", self.host, e))?;

        let base_path = base.path();
        if !base_path.is_empty() && base_path != "/" && !base_path.ends_with('/') {
            base.set_path(&format!("{}/", base_path));
        }

        base.join(path)
            .map_err(|e| anyhow::anyhow!("Failed to construct URL: {}", e))
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let AuthMethod::BearerToken(token) = &self.auth {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))?;
            headers.insert(HeaderName::from_static("authorization"), value);
        }
        Ok(headers)
    }

    pub async fn api_post(&self, path: &str, payload: &Value) -> Result<ApiResponse> {
        let url = self.build_url(path)?;
        tracing::debug!(%url, "LLM_REQUEST");

        let response = self
            .client
            .post(url)
            .headers(self.auth_headers()?)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let payload = response.json().await.ok();
        Ok(ApiResponse { status, payload })
    }
}

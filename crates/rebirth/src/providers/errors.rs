use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Provider unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

fn is_network_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || (err.status().is_none() && err.is_request())
}

impl From<anyhow::Error> for ProviderError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<reqwest::Error>() {
            Ok(reqwest_error) => reqwest_error.into(),
            Err(other) => ProviderError::RequestFailed(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if is_network_error(&error) {
            let msg = if error.is_timeout() {
                "request timed out".to_string()
            } else if error.is_connect() {
                match error.url().and_then(|u| u.host_str().map(str::to_string)) {
                    Some(host) => format!("could not connect to {}", host),
                    None => "could not connect to the provider".to_string(),
                }
            } else {
                error.to_string()
            };
            return ProviderError::NetworkError(msg);
        }

        match error.status() {
            Some(status) => ProviderError::RequestFailed(format!("{} (status: {})", error, status)),
            None => ProviderError::RequestFailed(error.to_string()),
        }
    }
}

pub mod prompt;
pub mod service;
pub mod types;

pub use service::{AnswerError, AnswerOutcome, AnswerService, MIN_QUERY_CHARS};

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::types::GenerateContentRequest;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("API error: {0}")]
    Status(StatusCode),
    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

/// Secret credential for the generation API. `Debug` never shows the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

/// Performs one raw generation call and returns the decoded success body.
#[async_trait]
pub trait AnswerBackend: Send + Sync + fmt::Debug {
    async fn generate(
        &self,
        api_key: &ApiKey,
        request: &GenerateContentRequest,
    ) -> Result<Value, ClientError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub model: String,
    pub user_agent: String,
    /// `None` leaves the transport default in place.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            user_agent: concat!("kawAI/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: None,
        }
    }
}

#[derive(Debug)]
pub struct GeminiClient {
    http: Client,
    config: ClientConfig,
}

impl GeminiClient {
    pub fn with_config(config: ClientConfig) -> Result<Self, ClientError> {
        let mut builder = Client::builder().user_agent(config.user_agent.clone()).gzip(true);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|err| ClientError::Build(err.to_string()))?;

        Ok(Self { http, config })
    }

    pub fn new() -> Result<Self, ClientError> {
        Self::with_config(ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Endpoint URL without the credential.
    pub fn generate_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl AnswerBackend for GeminiClient {
    #[instrument(name = "gemini_client.generate", skip_all, fields(model = %self.config.model))]
    async fn generate(
        &self,
        api_key: &ApiKey,
        request: &GenerateContentRequest,
    ) -> Result<Value, ClientError> {
        let url = self.generate_url();
        let response = self
            .http
            .post(&url)
            .query(&[("key", api_key.expose())])
            .json(request)
            .send()
            .await
            .map_err(|err| ClientError::Http(err.without_url().to_string()))?;

        if !response.status().is_success() {
            warn!(
                target: "kawai_client",
                status = %response.status(),
                url,
                "generation request failed"
            );
            return Err(ClientError::Status(response.status()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| ClientError::Http(err.without_url().to_string()))?;

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Ok(value),
            Err(error) => {
                warn!(target: "kawai_client", error = %error, "success body is not JSON");
                Ok(Value::Null)
            }
        }
    }
}

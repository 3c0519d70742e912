use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    prompt::{build_prompt, FALLBACK_ANSWER},
    types::{extract_answer, GenerateContentRequest},
    AnswerBackend, ApiKey, ClientError,
};

/// Trimmed queries shorter than this never reach the backend.
pub const MIN_QUERY_CHARS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    Answered(String),
    /// The service answered but the body had no usable text.
    NoClearAnswer,
    /// The query was too short to send.
    TooShort,
}

impl AnswerOutcome {
    /// Answer text to display; empty for [`AnswerOutcome::TooShort`].
    pub fn display_text(&self) -> &str {
        match self {
            Self::Answered(text) => text,
            Self::NoClearAnswer => FALLBACK_ANSWER,
            Self::TooShort => "",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum AnswerError {
    #[error("API key is not set. Please check your configuration.")]
    MissingApiKey,
    #[error("failed to get an answer: {0}")]
    Network(#[from] ClientError),
}

impl AnswerError {
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingApiKey => self.to_string(),
            Self::Network(source) => {
                format!("Failed to get an answer ({source}). Please check the logs.")
            }
        }
    }
}

/// Turns a query into an answer using an [`AnswerBackend`].
#[derive(Debug, Clone)]
pub struct AnswerService {
    backend: Arc<dyn AnswerBackend>,
}

impl AnswerService {
    pub fn new(backend: Arc<dyn AnswerBackend>) -> Self {
        Self { backend }
    }

    pub async fn fetch_answer(
        &self,
        api_key: Option<&ApiKey>,
        query: &str,
    ) -> Result<AnswerOutcome, AnswerError> {
        let Some(api_key) = api_key else {
            warn!(target: "kawai_client", "no API key bound; skipping request");
            return Err(AnswerError::MissingApiKey);
        };

        let query = query.trim();
        if query.chars().count() < MIN_QUERY_CHARS {
            debug!(target: "kawai_client", "query too short; skipping request");
            return Ok(AnswerOutcome::TooShort);
        }

        let request = GenerateContentRequest::single_turn(build_prompt(query));
        let body = self.backend.generate(api_key, &request).await?;

        match extract_answer(&body) {
            Some(text) => Ok(AnswerOutcome::Answered(text)),
            None => {
                warn!(target: "kawai_client", "response had no candidate text; using fallback");
                Ok(AnswerOutcome::NoClearAnswer)
            }
        }
    }
}

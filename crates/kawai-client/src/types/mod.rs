pub mod models;

pub use models::{Candidate, Content, GenerateContentRequest, GenerateContentResponse, Part};

use serde_json::Value;
use tracing::debug;

/// Pulls the answer text out of a raw success body.
///
/// Returns `None` when the body does not have the
/// `candidates[0].content.parts[0].text` shape, including bodies that are not
/// objects at all.
pub fn extract_answer(body: &Value) -> Option<String> {
    match serde_json::from_value::<GenerateContentResponse>(body.clone()) {
        Ok(response) => response.first_text().map(str::to_string),
        Err(error) => {
            debug!(target: "kawai_client", error = %error, "response body has unexpected shape");
            None
        }
    }
}

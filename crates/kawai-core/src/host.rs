use async_trait::async_trait;
use kawai_client::ApiKey;
use thiserror::Error;

use crate::secret::SecretError;

pub const ESCAPE_KEY: &str = "Escape";

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("host connection closed")]
    Disconnected,
    #[error("host rejected request: {0}")]
    Rejected(String),
}

/// Capabilities the native window host offers the palette core.
#[async_trait]
pub trait HostBridge: Send + Sync {
    /// `Ok(None)` when no key is bound.
    async fn retrieve_secret(&self) -> Result<Option<ApiKey>, HostError>;

    async fn hide_window(&self) -> Result<(), HostError>;

    /// Returns focus to the query field. Hosts must always have one.
    fn focus_input(&self);
}

/// Only the literal `Escape` key is a palette command; every other key is text.
pub fn is_escape(key: &str) -> bool {
    key == ESCAPE_KEY
}

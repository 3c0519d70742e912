use std::path::{Path, PathBuf};

use directories::BaseDirs;
use kawai_client::ApiKey;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

pub const API_KEY_ENV: &str = "KAWAI_API_KEY";
pub const RC_FILE_NAME: &str = ".kawairc";
pub const PLACEHOLDER_KEY: &str = "YOUR_GEMINI_API_KEY_HERE";
const KEY_PREFIX: &str = "API_KEY=";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("could not find home directory")]
    NoHomeDirectory,
    #[error("failed to create config file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("API_KEY not found in {0}")]
    MissingEntry(PathBuf),
}

/// Resolves the API key from the environment first, then from the rc file.
#[derive(Debug, Clone)]
pub struct SecretSource {
    rc_path: PathBuf,
    env_var: Option<String>,
}

impl SecretSource {
    pub fn new(rc_path: impl Into<PathBuf>) -> Self {
        Self {
            rc_path: rc_path.into(),
            env_var: Some(API_KEY_ENV.to_string()),
        }
    }

    /// Uses `~/.kawairc`.
    pub fn from_home() -> Result<Self, SecretError> {
        Ok(Self::new(default_rc_path()?))
    }

    /// Skips the environment lookup; only the rc file is consulted.
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.env_var = None;
        self
    }

    pub fn rc_path(&self) -> &Path {
        &self.rc_path
    }

    /// `Ok(None)` means no key is bound: the file was just created, or it
    /// still holds the placeholder or an empty value.
    pub async fn load(&self) -> Result<Option<ApiKey>, SecretError> {
        if let Some(name) = &self.env_var {
            if let Ok(value) = std::env::var(name) {
                if let Some(key) = bound_key(&value) {
                    debug!(
                        target: "kawai_secret",
                        source = %name,
                        "API key taken from environment"
                    );
                    return Ok(Some(key));
                }
            }
        }

        let path = &self.rc_path;
        if !fs::try_exists(path).await.unwrap_or(false) {
            fs::write(path, format!("{KEY_PREFIX}{PLACEHOLDER_KEY}"))
                .await
                .map_err(|source| SecretError::Create {
                    path: path.clone(),
                    source,
                })?;
            info!(
                target: "kawai_secret",
                path = %path.display(),
                "created config file with placeholder key"
            );
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|source| SecretError::Read {
                path: path.clone(),
                source,
            })?;

        content
            .lines()
            .find_map(|line| line.strip_prefix(KEY_PREFIX))
            .map(bound_key)
            .ok_or_else(|| SecretError::MissingEntry(path.clone()))
    }
}

pub fn default_rc_path() -> Result<PathBuf, SecretError> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(RC_FILE_NAME))
        .ok_or(SecretError::NoHomeDirectory)
}

fn bound_key(raw: &str) -> Option<ApiKey> {
    let value = raw.trim();
    if value.is_empty() || value == PLACEHOLDER_KEY {
        None
    } else {
        Some(ApiKey::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_is_created_with_placeholder() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(RC_FILE_NAME);
        let source = SecretSource::new(&path).without_env();

        let key = source.load().await.expect("load");

        assert!(key.is_none());
        let written = std::fs::read_to_string(&path).expect("file created");
        assert_eq!(written, "API_KEY=YOUR_GEMINI_API_KEY_HERE");
    }

    #[tokio::test]
    async fn reads_key_line_and_trims() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(RC_FILE_NAME);
        std::fs::write(&path, "# kawai\nTHEME=dark\nAPI_KEY=  abc123  \n").expect("write");

        let key = SecretSource::new(&path).without_env().load().await.expect("load");

        assert_eq!(key.map(|key| key.expose().to_string()), Some("abc123".to_string()));
    }

    #[tokio::test]
    async fn placeholder_counts_as_unbound() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(RC_FILE_NAME);
        std::fs::write(&path, "API_KEY=YOUR_GEMINI_API_KEY_HERE").expect("write");

        let key = SecretSource::new(&path).without_env().load().await.expect("load");
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn file_without_entry_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(RC_FILE_NAME);
        std::fs::write(&path, "SOMETHING_ELSE=1\n").expect("write");

        let error = SecretSource::new(&path)
            .without_env()
            .load()
            .await
            .expect_err("missing entry");
        assert!(matches!(error, SecretError::MissingEntry(_)));
    }
}

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use kawai_client::{ClientConfig, DEFAULT_ENDPOINT, DEFAULT_MODEL};
use serde::{Deserialize, Serialize};

use crate::debounce::{DebounceSettings, DEFAULT_DEBOUNCE, DEFAULT_TRIGGER_THRESHOLD};

pub const ENV_PREFIX: &str = "KAWAI";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// User-tunable settings, layered from an optional TOML file and `KAWAI_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub debounce_ms: u64,
    pub trigger_threshold: usize,
    pub model: String,
    pub endpoint: String,
    pub request_timeout_secs: Option<u64>,
    /// Overrides `~/.kawairc`.
    pub rc_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debounce_ms: u64::try_from(DEFAULT_DEBOUNCE.as_millis()).unwrap_or(500),
            trigger_threshold: DEFAULT_TRIGGER_THRESHOLD,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout_secs: None,
            rc_path: None,
        }
    }
}

impl Settings {
    /// Loads `path` (or the default config file) then applies the environment.
    /// A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };

        let mut builder = Config::builder();
        if let Some(file) = &file {
            builder = builder.add_source(
                File::from(file.as_path())
                    .format(FileFormat::Toml)
                    .required(path.is_some()),
            );
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .ignore_empty(true),
        );

        builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize::<Self>()
            .context("invalid configuration")
    }

    pub fn debounce(&self) -> DebounceSettings {
        DebounceSettings {
            delay: Duration::from_millis(self.debounce_ms),
            trigger_threshold: self.trigger_threshold,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
            ..ClientConfig::default()
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "kawai", "kawai").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_palette_behaviour() {
        let settings = Settings::default();
        assert_eq!(settings.debounce(), DebounceSettings::default());
        assert_eq!(settings.model, "gemini-2.0-flash");
        assert!(settings.client_config().request_timeout.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "debounce_ms = 250\nmodel = \"gemini-1.5-pro\"\nrequest_timeout_secs = 20\n",
        )
        .expect("write");

        let settings = Settings::load(Some(&path)).expect("load");

        assert_eq!(settings.debounce_ms, 250);
        assert_eq!(settings.trigger_threshold, DEFAULT_TRIGGER_THRESHOLD);
        assert_eq!(settings.model, "gemini-1.5-pro");
        assert_eq!(
            settings.client_config().request_timeout,
            Some(Duration::from_secs(20))
        );
        assert_eq!(settings.debounce().delay, Duration::from_millis(250));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let result = Settings::load(Some(&dir.path().join("absent.toml")));
        assert!(result.is_err());
    }
}

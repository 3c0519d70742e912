use std::sync::Arc;

use anyhow::Result;
use kawai_client::{AnswerService, GeminiClient};

pub mod debounce;
pub mod host;
pub mod runtime;
pub mod secret;
pub mod session;
pub mod settings;
pub mod transport;

use secret::SecretSource;
use settings::Settings;
use time::OffsetDateTime;
use tracing::{debug, info};

/// Inputs required to bring up a palette session.
#[derive(Debug, Clone)]
pub struct PaletteConfig {
    pub settings: Settings,
    /// Timestamp captured during process initialization for diagnostics.
    pub boot_timestamp: OffsetDateTime,
    /// How the native host talks to the session.
    pub mode: ServeMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    Stdio,
    Headless,
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            boot_timestamp: OffsetDateTime::now_utc(),
            mode: ServeMode::Stdio,
        }
    }
}

#[derive(Clone)]
pub struct CoreRuntime {
    config: PaletteConfig,
    service: AnswerService,
    secrets: SecretSource,
}

impl CoreRuntime {
    pub fn service(&self) -> AnswerService {
        self.service.clone()
    }

    pub fn secrets(&self) -> &SecretSource {
        &self.secrets
    }

    pub fn config(&self) -> &PaletteConfig {
        &self.config
    }

    pub async fn serve(&self) -> Result<()> {
        match self.config.mode {
            ServeMode::Stdio => {
                transport::serve_stdio(
                    self.service.clone(),
                    self.secrets.clone(),
                    self.config.settings.debounce(),
                )
                .await?;
            }
            ServeMode::Headless => {
                debug!(target: "kawai_core", "Headless mode: skipping host loop");
            }
        }
        Ok(())
    }
}

pub async fn bootstrap(config: PaletteConfig) -> Result<CoreRuntime> {
    let client = GeminiClient::with_config(config.settings.client_config())?;
    debug!(
        target: "kawai_core",
        endpoint = %client.config().endpoint,
        model = %client.config().model,
        "GeminiClient initialized"
    );

    let secrets = match &config.settings.rc_path {
        Some(path) => SecretSource::new(path.clone()),
        None => SecretSource::from_home()?,
    };

    info!(
        target: "kawai_core",
        rc_path = %secrets.rc_path().display(),
        boot_timestamp = %config.boot_timestamp,
        mode = ?config.mode,
        "Palette core starting"
    );

    let service = AnswerService::new(Arc::new(client));
    Ok(CoreRuntime {
        config,
        service,
        secrets,
    })
}

pub use debounce::{DebounceSettings, DEFAULT_DEBOUNCE, DEFAULT_TRIGGER_THRESHOLD};
pub use host::{HostBridge, HostError};
pub use runtime::{PaletteClosed, PaletteHandle, PaletteRuntimeBuilder};
pub use session::{Phase, SessionSnapshot};

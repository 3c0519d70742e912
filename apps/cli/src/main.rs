use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use indicatif::ProgressBar;
use kawai_core::{
    bootstrap, debounce::Debouncer, settings::Settings, CoreRuntime, PaletteConfig,
    PaletteHandle, PaletteRuntimeBuilder, Phase, ServeMode, SessionSnapshot,
};
use output::{OutputFormat, Renderer};
use progress::spinner;
use serde::Serialize;
use terminal::TerminalHost;
use time::OffsetDateTime;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser, Clone)]
#[command(
    name = "kawai",
    version,
    about = "Ask the kawAI command palette developer questions from the shell."
)]
struct Cli {
    /// Preferred renderer for command output.
    #[arg(long, global = true, value_enum, default_value = "markdown")]
    format: OutputFormat,
    /// Settings file to load instead of the default location.
    #[arg(long, global = true, env = "KAWAI_CONFIG")]
    config: Option<PathBuf>,
    /// Disable ANSI colors in CLI output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Suppress non-critical CLI output.
    #[arg(long, global = true)]
    quiet: bool,
    /// Disable progress indicators while waiting for answers.
    #[arg(long, global = true)]
    no_progress: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, Clone)]
enum Command {
    /// Run the palette session for a native host over STDIO (newline JSON).
    Serve,
    /// Ask a single question and print the answer.
    Ask {
        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Interactive palette: each line replaces the query.
    ///
    /// `:clear` clears the answer, `:esc` or end of input closes the palette.
    Palette,
    /// Show resolved settings and whether an API key is bound.
    Config,
    /// Generate shell completion scripts.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Debug, Serialize)]
struct ConfigReport {
    config_file: Option<String>,
    rc_path: String,
    api_key_bound: bool,
    settings: Settings,
}

impl Cli {
    fn progress_enabled(&self) -> bool {
        !self.quiet && !self.no_progress
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    if cli.no_color {
        std::env::set_var("NO_COLOR", "1");
    }

    if let Command::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "kawai", &mut std::io::stdout());
        return Ok(());
    }

    let settings = Settings::load(cli.config.as_deref())?;
    let config = PaletteConfig {
        settings,
        boot_timestamp: OffsetDateTime::now_utc(),
        mode: match cli.command {
            Command::Serve => ServeMode::Stdio,
            _ => ServeMode::Headless,
        },
    };

    let runtime = bootstrap(config).await?;
    let renderer = Renderer::new(cli.format);

    match &cli.command {
        Command::Serve => runtime.serve().await,
        Command::Ask { query } => handle_ask(query.join(" "), &cli, &renderer, &runtime).await,
        Command::Palette => handle_palette(&cli, &renderer, &runtime).await,
        Command::Config => handle_config(&cli, &renderer, &runtime).await,
        Command::Completions { .. } => Ok(()),
    }
}

fn spawn_palette(
    runtime: &CoreRuntime,
    host: Arc<TerminalHost>,
) -> (PaletteHandle, JoinHandle<()>) {
    PaletteRuntimeBuilder::new(runtime.service(), host)
        .debounce(runtime.config().settings.debounce())
        .spawn()
}

async fn handle_ask(
    query: String,
    cli: &Cli,
    renderer: &Renderer,
    runtime: &CoreRuntime,
) -> Result<()> {
    let debounce = runtime.config().settings.debounce();
    if !Debouncer::new(debounce).meets_threshold(&query) {
        bail!(
            "query is too short: at least {} characters are needed",
            debounce.trigger_threshold
        );
    }

    let host = Arc::new(TerminalHost::new(runtime.secrets().clone()));
    let (handle, task) = spawn_palette(runtime, host);

    let spinner = spinner(cli.progress_enabled(), "Asking kawAI...");
    handle.set_query(query.clone())?;

    let mut snapshots = handle.subscribe();
    let settled = snapshots
        .wait_for(|snapshot| snapshot.query == query && !snapshot.loading)
        .await
        .map(|snapshot| snapshot.clone());
    finish_spinner(spinner);

    handle.unmount()?;
    task.await.context("palette session panicked")?;

    let snapshot = settled.map_err(|_| anyhow!("palette session ended before answering"))?;
    if snapshot.phase == Phase::Failed {
        bail!(snapshot.error.unwrap_or_default());
    }
    info!(target: "kawai_cli", phase = ?snapshot.phase, "question answered");

    if !cli.quiet {
        renderer.answer(&snapshot)?;
    }
    Ok(())
}

async fn handle_palette(cli: &Cli, renderer: &Renderer, runtime: &CoreRuntime) -> Result<()> {
    let host = Arc::new(TerminalHost::new(runtime.secrets().clone()));
    let (handle, task) = spawn_palette(runtime, host.clone());
    let mut snapshots = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut spinner: Option<ProgressBar> = None;
    let mut input_open = true;

    if !cli.quiet {
        eprintln!("Type a question. `:clear` clears the answer, `:esc` closes the palette.");
    }

    loop {
        tokio::select! {
            () = host.hidden() => break,
            line = lines.next_line(), if input_open => {
                match line? {
                    Some(line) => match line.trim() {
                        ":clear" => handle.clear_and_focus()?,
                        ":esc" => handle.key(terminal::ESCAPE)?,
                        _ => handle.set_query(line)?,
                    },
                    None => {
                        debug!(target: "kawai_cli", "stdin closed; closing palette");
                        input_open = false;
                        handle.key(terminal::ESCAPE)?;
                    }
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                spinner = show_snapshot(cli, renderer, &snapshot, spinner)?;
            }
        }
    }

    finish_spinner(spinner);
    handle.unmount()?;
    task.await.context("palette session panicked")?;
    Ok(())
}

/// Keeps a spinner running while a fetch is pending and prints settled states.
/// The previous answer stays on screen while a new query is debounced, so
/// nothing is printed until loading clears.
fn show_snapshot(
    cli: &Cli,
    renderer: &Renderer,
    snapshot: &SessionSnapshot,
    spinner: Option<ProgressBar>,
) -> Result<Option<ProgressBar>> {
    if snapshot.loading {
        return Ok(spinner.or_else(|| progress::spinner(cli.progress_enabled(), "Thinking...")));
    }

    finish_spinner(spinner);
    match snapshot.phase {
        Phase::Answered if !cli.quiet => renderer.answer(snapshot)?,
        Phase::Failed => {
            if let Some(error) = &snapshot.error {
                eprintln!("error: {error}");
            }
        }
        _ => {}
    }
    Ok(None)
}

async fn handle_config(cli: &Cli, renderer: &Renderer, runtime: &CoreRuntime) -> Result<()> {
    let secrets = runtime.secrets();
    let api_key_bound = secrets
        .load()
        .await
        .context("failed to inspect API key")?
        .is_some();

    if cli.quiet {
        return Ok(());
    }

    let config_file = cli
        .config
        .clone()
        .or_else(kawai_core::settings::default_config_path)
        .map(|path| path.display().to_string());
    let report = ConfigReport {
        config_file,
        rc_path: secrets.rc_path().display().to_string(),
        api_key_bound,
        settings: runtime.config().settings.clone(),
    };
    renderer.config(&report)
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kawai_cli=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .without_time()
        .with_ansi(!cli.no_color)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow!("failed to initialize logging: {error}"))
}

fn finish_spinner(spinner: Option<ProgressBar>) {
    if let Some(progress) = spinner {
        progress.finish_and_clear();
    }
}

mod terminal {
    use async_trait::async_trait;
    use kawai_client::ApiKey;
    use kawai_core::{secret::SecretSource, HostBridge, HostError};
    use tokio::sync::Notify;

    pub use kawai_core::host::ESCAPE_KEY as ESCAPE;

    /// Host for shell sessions. Hiding ends the session; focus is implicit.
    #[derive(Debug)]
    pub struct TerminalHost {
        secrets: SecretSource,
        hidden: Notify,
    }

    impl TerminalHost {
        pub fn new(secrets: SecretSource) -> Self {
            Self {
                secrets,
                hidden: Notify::new(),
            }
        }

        pub async fn hidden(&self) {
            self.hidden.notified().await;
        }
    }

    #[async_trait]
    impl HostBridge for TerminalHost {
        async fn retrieve_secret(&self) -> Result<Option<ApiKey>, HostError> {
            Ok(self.secrets.load().await?)
        }

        async fn hide_window(&self) -> Result<(), HostError> {
            self.hidden.notify_one();
            Ok(())
        }

        fn focus_input(&self) {
            eprint!("> ");
        }
    }
}

mod output {
    use anyhow::Result;
    use clap::ValueEnum;
    use kawai_core::SessionSnapshot;

    #[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
    pub enum OutputFormat {
        Json,
        Markdown,
        Text,
    }

    #[derive(Copy, Clone, Debug)]
    pub struct Renderer {
        format: OutputFormat,
    }

    impl Renderer {
        pub fn new(format: OutputFormat) -> Self {
            Self { format }
        }

        pub fn answer(&self, snapshot: &SessionSnapshot) -> Result<()> {
            let answer = snapshot.answer.as_deref().unwrap_or_default();
            match self.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(snapshot)?);
                }
                OutputFormat::Markdown => {
                    println!("> {}", snapshot.query.trim());
                    println!();
                    println!("{}", answer.trim());
                }
                OutputFormat::Text => {
                    println!("{}", answer.trim());
                }
            }
            Ok(())
        }

        pub fn config(&self, report: &crate::ConfigReport) -> Result<()> {
            let config_file = report.config_file.as_deref().unwrap_or("n/a");
            let timeout = report
                .settings
                .request_timeout_secs
                .map_or_else(|| "none".to_string(), |secs| format!("{secs}s"));
            match self.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(report)?);
                }
                OutputFormat::Markdown => {
                    println!("| Property | Value |");
                    println!("| --- | --- |");
                    println!("| Config File | `{config_file}` |");
                    println!("| Key File | `{}` |", report.rc_path);
                    println!("| API Key Bound | {} |", report.api_key_bound);
                    println!("| Model | `{}` |", report.settings.model);
                    println!("| Endpoint | {} |", report.settings.endpoint);
                    println!("| Debounce (ms) | {} |", report.settings.debounce_ms);
                    println!("| Trigger Threshold | {} |", report.settings.trigger_threshold);
                    println!("| Request Timeout | {timeout} |");
                }
                OutputFormat::Text => {
                    println!("Config file: {config_file}");
                    println!("Key file: {}", report.rc_path);
                    println!("API key bound: {}", report.api_key_bound);
                    println!("Model: {}", report.settings.model);
                    println!("Endpoint: {}", report.settings.endpoint);
                    println!("Debounce: {} ms", report.settings.debounce_ms);
                    println!("Trigger threshold: {}", report.settings.trigger_threshold);
                    println!("Request timeout: {timeout}");
                }
            }
            Ok(())
        }
    }
}

mod progress {
    use std::time::Duration;

    use indicatif::{ProgressBar, ProgressStyle};

    pub fn spinner(message_enabled: bool, message: impl Into<String>) -> Option<ProgressBar> {
        if !message_enabled {
            return None;
        }
        let progress = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        progress.set_style(style);
        progress.set_message(message.into());
        progress.enable_steady_tick(Duration::from_millis(80));
        Some(progress)
    }
}

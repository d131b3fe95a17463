pub mod cleaner;
mod console;
pub mod control;
mod error;
pub mod input;
mod metrics;
pub mod network;
pub mod orchestrator;
mod permissions;
pub mod platform;
pub mod prompt;
mod secure_storage;
pub mod settings;
pub mod state;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::ConsolePresentation;
use error::AppError;
use input::clipboard::ArboardClipboard;
use input::injector::EnigoInput;
use network::{LlmClient, ProviderKind};
use orchestrator::{Backends, Orchestrator};
use secure_storage::KeyringStore;
use settings::{ApiKeyLocation, SettingsStore, normalize_loaded_settings, read_config};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gengo", version, about = "Transform selected text with an LLM and paste it back")]
struct Cli {
    /// Settings file to use instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon and listen for control commands (default).
    Serve,
    /// Send one control command to a running daemon, e.g. `gengo send preset 1`.
    Send {
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },
    /// Print the settings file path and the active settings.
    Settings,
    /// Store the LLM API key, in the OS keyring when available.
    SetApiKey { api_key: String },
    /// Report clipboard, keystroke and focus access.
    Check,
}

fn init_logging() -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| AppError::LoggingInit(err.to_string()))
}

fn open_settings(path: Option<PathBuf>) -> Result<SettingsStore, AppError> {
    match path {
        Some(path) => Ok(SettingsStore::new(path, Arc::new(KeyringStore))),
        None => Ok(SettingsStore::open_default()?),
    }
}

fn build_backends() -> Result<Backends, AppError> {
    let clipboard = ArboardClipboard::spawn().map_err(|err| AppError::Backend(err.to_string()))?;
    if let Err(err) = EnigoInput::probe() {
        warn!("keystroke simulation unavailable, copy/paste chords will fail: {err}");
    }
    let llm = LlmClient::new().map_err(|err| AppError::Backend(err.to_string()))?;

    Ok(Backends {
        clipboard: Arc::new(clipboard),
        keys: Arc::new(EnigoInput::new()),
        focus: platform::default_focus_backend(),
        llm: Arc::new(llm),
        presentation: Arc::new(ConsolePresentation::new()),
    })
}

async fn serve(store: SettingsStore) -> Result<(), AppError> {
    let settings = store.load()?;
    info!(
        path = %store.path().display(),
        provider = settings.llm_provider.as_str(),
        model = %settings.model_name,
        has_api_key = !settings.api_key.is_empty(),
        auto_apply_and_close = settings.auto_apply_and_close,
        "settings loaded"
    );
    if settings.llm_provider == ProviderKind::Remote && settings.api_key.is_empty() {
        warn!("remote provider configured without an API key; requests will be sent unauthenticated");
    }

    let orchestrator = Orchestrator::new(build_backends()?, settings.orchestrator_config());
    let listener = control::bind(settings.control_port).await?;
    for (command, shortcut) in settings.shortcut_bindings() {
        info!(shortcut = %shortcut, "bind this shortcut to `gengo send {command}`");
    }

    tokio::select! {
        result = control::serve(listener, control::Daemon::new(orchestrator, store)) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| AppError::Runtime(err.to_string()))?;
            info!("shutting down");
        }
    }
    Ok(())
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let store = open_settings(cli.config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(store).await?,
        Command::Send { command } => {
            // Only the port is needed; skip the keyring.
            let port = normalize_loaded_settings(read_config(store.path())?).control_port;
            let reply = control::send_command(port, &command.join(" ")).await?;
            println!("{reply}");
            if reply.starts_with("err") {
                anyhow::bail!("daemon rejected `{}`", command.join(" "));
            }
        }
        Command::Settings => {
            let settings = store.load()?;
            println!("{}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&settings.masked())?);
        }
        Command::SetApiKey { api_key } => match store.set_api_key(&api_key)? {
            ApiKeyLocation::SecureStorage => {
                println!("API key stored in the OS keyring. Run `gengo send reload` to use it in a running daemon.")
            }
            ApiKeyLocation::SettingsFile => println!(
                "OS keyring unavailable; API key stored in {}. Run `gengo send reload` to use it in a running daemon.",
                store.path().display()
            ),
        },
        Command::Check => {
            let report = permissions::check_permissions().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    if let Err(init_err) = init_logging() {
        eprintln!("logging bootstrap failed: {init_err}");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("gengo: {}", AppError::Runtime(err.to_string()));
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gengo: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_joins_words_into_one_command() {
        let cli = Cli::parse_from(["gengo", "send", "ask", "make", "it", "polite"]);
        match cli.command {
            Some(Command::Send { command }) => assert_eq!(command.join(" "), "ask make it polite"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn serve_is_the_default() {
        let cli = Cli::parse_from(["gengo", "--config", "/tmp/gengo.json"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/gengo.json")));
    }
}

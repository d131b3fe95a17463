//! Line-oriented control channel on localhost. Any hotkey tool can drive the
//! daemon by sending one command per line, e.g. `printf 'translate\n' | nc
//! 127.0.0.1 47913`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::orchestrator::{Orchestrator, TriggerOutcome};
use crate::prompt::ProcessingMode;
use crate::settings::{AppSettings, SettingsStore};

const CONTROL_HOST: &str = "127.0.0.1";
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("empty command")]
    Empty,
    #[error(
        "unknown command `{0}` (expected translate, correct, preset <n>, ask <instruction>, apply, dismiss, status or reload)"
    )]
    Unknown(String),
    #[error("`{command}`: {message}")]
    InvalidArgument { command: &'static str, message: String },
    #[error("failed to listen on 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to reach gengo on 127.0.0.1:{port} (is `gengo serve` running?): {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("control connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon closed the connection without replying")]
    NoReply,
    #[error("failed to reload settings: {0}")]
    Reload(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Trigger(ProcessingMode),
    Apply,
    Dismiss,
    Status,
    Reload,
}

impl FromStr for ControlCommand {
    type Err = ControlError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "" => return Err(ControlError::Empty),
            "translate" => ControlCommand::Trigger(ProcessingMode::Translation),
            "correct" => ControlCommand::Trigger(ProcessingMode::Correction),
            "preset" => {
                let number: usize = rest.parse().map_err(|_| ControlError::InvalidArgument {
                    command: "preset",
                    message: format!("`{rest}` is not a preset number"),
                })?;
                if number == 0 {
                    return Err(ControlError::InvalidArgument {
                        command: "preset",
                        message: "presets are numbered from 1".to_string(),
                    });
                }
                ControlCommand::Trigger(ProcessingMode::CustomPreset(number - 1))
            }
            "ask" => {
                if rest.is_empty() {
                    return Err(ControlError::InvalidArgument {
                        command: "ask",
                        message: "an instruction is required".to_string(),
                    });
                }
                ControlCommand::Trigger(ProcessingMode::OnDemand(rest.to_string()))
            }
            "apply" => ControlCommand::Apply,
            "dismiss" => ControlCommand::Dismiss,
            "status" => ControlCommand::Status,
            "reload" => ControlCommand::Reload,
            _ => return Err(ControlError::Unknown(verb.to_string())),
        };

        if !rest.is_empty() && !matches!(verb.to_ascii_lowercase().as_str(), "preset" | "ask") {
            return Err(ControlError::InvalidArgument {
                command: "command",
                message: format!("`{verb}` takes no arguments"),
            });
        }

        Ok(command)
    }
}

/// The running service as seen from the control channel.
#[derive(Clone)]
pub struct Daemon {
    orchestrator: Arc<Orchestrator>,
    settings: SettingsStore,
}

impl Daemon {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: SettingsStore) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    /// Re-reads the settings file and keyring; the new configuration applies
    /// from the next session. The control port is only read at startup.
    async fn reload(&self) -> Result<AppSettings, ControlError> {
        let store = self.settings.clone();
        let settings = tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|err| ControlError::Reload(err.to_string()))?
            .map_err(|err| ControlError::Reload(err.to_string()))?;

        self.orchestrator
            .update_config(settings.orchestrator_config())
            .await;
        info!(
            model = %settings.model_name,
            has_api_key = !settings.api_key.is_empty(),
            auto_apply_and_close = settings.auto_apply_and_close,
            "settings reloaded"
        );
        Ok(settings)
    }
}

/// Runs one command and renders the single-line reply.
pub async fn execute(daemon: &Daemon, command: ControlCommand) -> String {
    let orchestrator = &daemon.orchestrator;
    match command {
        ControlCommand::Trigger(mode) => match orchestrator.trigger(mode).await {
            TriggerOutcome::Started { epoch, .. } => format!("ok started session {epoch}"),
            TriggerOutcome::Applied(Ok(())) => "ok applied".to_string(),
            TriggerOutcome::Applied(Err(err)) => format!("err {err}"),
            TriggerOutcome::Dropped(state) => format!("err busy ({state})"),
        },
        ControlCommand::Apply => match orchestrator.apply_requested().await {
            Ok(()) => "ok applied".to_string(),
            Err(err) => format!("err {err}"),
        },
        ControlCommand::Dismiss => {
            if orchestrator.dismiss_requested().await {
                "ok dismissed".to_string()
            } else {
                "ok nothing to dismiss".to_string()
            }
        }
        ControlCommand::Status => match serde_json::to_string(&orchestrator.status().await) {
            Ok(json) => format!("ok {json}"),
            Err(err) => format!("err {err}"),
        },
        ControlCommand::Reload => match daemon.reload().await {
            Ok(settings) => format!(
                "ok reloaded (model {}, auto-apply {})",
                settings.model_name,
                if settings.auto_apply_and_close { "on" } else { "off" }
            ),
            Err(err) => format!("err {err}"),
        },
    }
}

pub async fn bind(port: u16) -> Result<TcpListener, ControlError> {
    TcpListener::bind((CONTROL_HOST, port))
        .await
        .map_err(|source| ControlError::Bind { port, source })
}

/// Accepts connections until the listener fails. Each connection is served on
/// its own task so a slow apply never blocks `dismiss` or `status`.
pub async fn serve(listener: TcpListener, daemon: Daemon) -> Result<(), ControlError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "control channel listening");
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "control connection accepted");
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, daemon).await {
                warn!(%peer, "control connection ended with error: {err}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, daemon: Daemon) -> Result<(), ControlError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match line.parse::<ControlCommand>() {
            Ok(command) => {
                info!(command = ?command, "control command received");
                execute(&daemon, command).await
            }
            Err(err) => format!("err {err}"),
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

/// Client side of `gengo send`: delivers one command and returns the reply.
pub async fn send_command(port: u16, command: &str) -> Result<String, ControlError> {
    command.parse::<ControlCommand>()?;

    let stream = TcpStream::connect((CONTROL_HOST, port))
        .await
        .map_err(|source| ControlError::Connect { port, source })?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(command.trim().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.shutdown().await?;

    let mut lines = BufReader::new(reader).lines();
    match tokio::time::timeout(REPLY_TIMEOUT, lines.next_line()).await {
        Ok(line) => line?.ok_or(ControlError::NoReply),
        Err(_) => Err(ControlError::NoReply),
    }
}

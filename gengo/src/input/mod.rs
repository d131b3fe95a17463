pub mod clipboard;
pub mod injector;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("failed to initialize input backend: {0}")]
    Initialization(String),
    #[error("failed to simulate keyboard input: {0}")]
    Keyboard(String),
    #[error("clipboard operation failed: {0}")]
    Clipboard(String),
    #[error("focus operation failed: {0}")]
    Focus(String),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("input worker stopped: {0}")]
    Worker(String),
    #[error("{operation} did not finish within {after_ms} ms")]
    TimedOut { operation: String, after_ms: u64 },
}

/// Runs a backend call that can block on the desktop (window manager, helper
/// process, clipboard owner) and gives up after `limit`. The future is dropped
/// on expiry, which kills helper processes spawned with `kill_on_drop`.
pub async fn bounded<T>(
    operation: &str,
    limit: Duration,
    call: impl Future<Output = Result<T, InputError>>,
) -> Result<T, InputError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(InputError::TimedOut {
            operation: operation.to_string(),
            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Control,
    Meta,
    Alt,
    Shift,
}

impl Modifier {
    /// Cmd on macOS, Ctrl everywhere else.
    pub fn primary() -> Self {
        if cfg!(target_os = "macos") {
            Modifier::Meta
        } else {
            Modifier::Control
        }
    }

    fn label(self) -> &'static str {
        match self {
            Modifier::Control => "Ctrl",
            Modifier::Meta => "Cmd",
            Modifier::Alt => "Alt",
            Modifier::Shift => "Shift",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chord {
    pub key: char,
    pub modifiers: Vec<Modifier>,
}

impl Chord {
    pub fn new(key: char, modifiers: Vec<Modifier>) -> Self {
        Self { key, modifiers }
    }

    pub fn copy() -> Self {
        Self::new('c', vec![Modifier::primary()])
    }

    pub fn paste() -> Self {
        Self::new('v', vec![Modifier::primary()])
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for modifier in &self.modifiers {
            write!(f, "{}+", modifier.label())?;
        }
        write!(f, "{}", self.key.to_ascii_uppercase())
    }
}

#[async_trait]
pub trait ClipboardStore: Send + Sync {
    /// Current text content; non-text or empty clipboards read as `""`.
    async fn read_text(&self) -> Result<String, InputError>;
    async fn write_text(&self, text: &str) -> Result<(), InputError>;
}

#[async_trait]
pub trait KeyInput: Send + Sync {
    /// Presses the modifiers, clicks the key, then releases the modifiers.
    async fn send_chord(&self, chord: &Chord) -> Result<(), InputError>;
}

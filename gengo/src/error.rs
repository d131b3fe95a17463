use thiserror::Error;

use crate::control::ControlError;
use crate::settings::SettingsError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
    #[error("failed to start async runtime: {0}")]
    Runtime(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("failed to initialize platform backend: {0}")]
    Backend(String),
}

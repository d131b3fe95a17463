pub mod llm_client;
pub mod sse;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use llm_client::LlmClient;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Local,
    Remote,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Remote => "remote",
        }
    }
}

/// Per-request view of the LLM settings.
#[derive(Clone, PartialEq, Eq)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Ceiling applied on top of the prompt-length budget.
    pub max_tokens: u32,
    pub timeout: Duration,
    pub stream: bool,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("has_api_key", &self.api_key.is_some())
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("stream", &self.stream)
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("failed to reach LLM endpoint: {0}")]
    Network(String),
    #[error("LLM endpoint returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("malformed LLM response: {0}")]
    MalformedResponse(String),
    #[error("LLM returned an empty response")]
    EmptyResponse,
    #[error("LLM request timed out after {0} ms")]
    Timeout(u64),
    #[error("failed to build LLM request: {0}")]
    RequestBuild(String),
}

/// Receives `(delta, aggregate_so_far)` for each streamed chunk.
pub type DeltaSink<'a> = &'a mut (dyn FnMut(&str, &str) + Send);

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Sends `prompt` and resolves with the full completion text. Streams when
    /// `config.stream` is set and a sink is given.
    async fn complete(
        &self,
        config: &LlmConfig,
        prompt: &str,
        on_delta: Option<DeltaSink<'_>>,
    ) -> Result<String, LlmError>;
}

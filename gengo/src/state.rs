use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::metrics::PerformanceReport;
use crate::platform::AppIdentity;
use crate::prompt::ProcessingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    CapturingSelection,
    AwaitingLlm,
    StreamingLlm,
    ResultReady,
    Applying,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::CapturingSelection => "capturing_selection",
            SessionState::AwaitingLlm => "awaiting_llm",
            SessionState::StreamingLlm => "streaming_llm",
            SessionState::ResultReady => "result_ready",
            SessionState::Applying => "applying",
            SessionState::Closed => "closed",
        }
    }

    /// Capture or LLM work is in flight.
    pub fn is_processing(self) -> bool {
        matches!(
            self,
            SessionState::CapturingSelection | SessionState::AwaitingLlm | SessionState::StreamingLlm
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the selection came from; used to re-target the paste.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionContext {
    pub app: AppIdentity,
    pub captured_at_ms: u64,
}

/// The single live capture/process/apply cycle. Epoch 0 is the resting
/// session; every trigger gets a fresh, increasing epoch.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub epoch: u64,
    pub state: SessionState,
    pub mode: Option<ProcessingMode>,
    pub selected_text: String,
    pub context: Option<SelectionContext>,
    pub result: Option<String>,
    pub started_at: Option<Instant>,
}

impl Session {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn begin(epoch: u64, mode: ProcessingMode) -> Self {
        Self {
            epoch,
            state: SessionState::CapturingSelection,
            mode: Some(mode),
            started_at: Some(Instant::now()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: SessionState,
    pub epoch: u64,
    pub mode: Option<String>,
    pub selected_chars: usize,
    pub has_result: bool,
    pub target_app: Option<String>,
    pub captured_at_ms: Option<u64>,
    pub metrics: PerformanceReport,
}

//! Capture, process and apply cycle for one selection at a time.
//!
//! Every external signal (trigger, apply, dismiss) goes through a method here
//! that inspects the current [`SessionState`] under the session lock before
//! acting. Long-running steps run outside the lock and re-check the session
//! epoch before writing their outcome back, so a dismissed or replaced
//! session can never be resurrected by a late completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cleaner::clean;
use crate::input::{Chord, ClipboardStore, InputError, KeyInput, bounded};
use crate::metrics::RuntimeMetrics;
use crate::network::{LlmBackend, LlmConfig};
use crate::platform::{ActivationTarget, AppIdentity, FocusBackend, activation_candidates};
use crate::prompt::{ProcessingMode, PromptConfig, build_prompt};
use crate::state::{SelectionContext, Session, SessionState, StatusReport};
use crate::utils::{now_epoch_ms, try_in_order};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Wait after the copy chord before reading the clipboard.
    pub capture_settle: Duration,
    /// Wait after re-activating the target before pasting.
    pub focus_settle: Duration,
    /// Wait after the paste chord before restoring the clipboard.
    pub clipboard_restore: Duration,
    pub close_delay: Duration,
    /// Bound on each focus query, activation and key chord.
    pub backend_call: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub llm: LlmConfig,
    pub prompt: PromptConfig,
    pub auto_apply_and_close: bool,
    pub timings: Timings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// The user-facing surface. Calls must return quickly; they are made while
/// the session lock is held so notifications arrive in transition order.
pub trait Presentation: Send + Sync {
    fn state_changed(&self, _state: SessionState) {}
    fn show_processing(&self, mode: &ProcessingMode);
    fn update_streaming_result(&self, text: &str);
    fn show_result(&self, original: &str, processed: &str);
    fn show_message(&self, text: &str, severity: Severity);
    fn close(&self);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("no result is ready to apply (session is {0})")]
    NotReady(SessionState),
    #[error("{0}")]
    Clipboard(InputError),
    #[error("clipboard did not retain the result ({expected_chars} chars written, {actual_chars} read back)")]
    Verification {
        expected_chars: usize,
        actual_chars: usize,
    },
    #[error("paste failed: {0}")]
    Paste(InputError),
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// A new session was admitted; `task` finishes once it reaches
    /// `ResultReady` or `Idle`.
    Started { epoch: u64, task: JoinHandle<()> },
    /// The trigger confirmed the pending result instead of starting over.
    Applied(Result<(), ApplyError>),
    Dropped(SessionState),
}

#[derive(Clone)]
pub struct Backends {
    pub clipboard: Arc<dyn ClipboardStore>,
    pub keys: Arc<dyn KeyInput>,
    pub focus: Arc<dyn FocusBackend>,
    pub llm: Arc<dyn LlmBackend>,
    pub presentation: Arc<dyn Presentation>,
}

struct CapturedSelection {
    app: AppIdentity,
    selection: Option<String>,
    captured_at_ms: u64,
}

struct PendingApply {
    epoch: u64,
    text: String,
    target: AppIdentity,
    started_at: Option<Instant>,
}

pub struct Orchestrator {
    backends: Backends,
    config: RwLock<OrchestratorConfig>,
    session: Mutex<Session>,
    next_epoch: AtomicU64,
    /// Epoch whose callbacks may still reach the surface; 0 when none.
    active_epoch: Arc<AtomicU64>,
    metrics: Mutex<RuntimeMetrics>,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn sentinel_marker(epoch: u64) -> String {
    format!("gengo-selection-probe:{epoch}:{}", now_epoch_ms())
}

impl Orchestrator {
    pub fn new(backends: Backends, config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            backends,
            config: RwLock::new(config),
            session: Mutex::new(Session::idle()),
            next_epoch: AtomicU64::new(0),
            active_epoch: Arc::new(AtomicU64::new(0)),
            metrics: Mutex::new(RuntimeMetrics::new()),
        })
    }

    /// Takes effect from the next session.
    pub async fn update_config(&self, config: OrchestratorConfig) {
        *self.config.write().await = config;
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state
    }

    pub async fn status(&self) -> StatusReport {
        let metrics = self.metrics.lock().await.report();
        let session = self.session.lock().await;
        StatusReport {
            state: session.state,
            epoch: session.epoch,
            mode: session.mode.as_ref().map(|mode| mode.label().to_string()),
            selected_chars: session.selected_text.chars().count(),
            has_result: session.result.is_some(),
            target_app: session.context.as_ref().map(|context| context.app.name.clone()),
            captured_at_ms: session.context.as_ref().map(|context| context.captured_at_ms),
            metrics,
        }
    }

    pub async fn trigger(self: &Arc<Self>, mode: ProcessingMode) -> TriggerOutcome {
        let epoch = {
            let mut session = self.session.lock().await;
            let current = session.state;
            match current {
                SessionState::Idle => {}
                SessionState::ResultReady => {
                    drop(session);
                    info!(mode = mode.label(), "trigger with a pending result; applying it");
                    return TriggerOutcome::Applied(self.apply_requested().await);
                }
                state => {
                    warn!(mode = mode.label(), %state, "trigger dropped while session is busy");
                    self.metrics.lock().await.record_dropped_trigger();
                    return TriggerOutcome::Dropped(state);
                }
            }

            let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *session = Session::begin(epoch, mode.clone());
            self.active_epoch.store(epoch, Ordering::SeqCst);
            self.backends
                .presentation
                .state_changed(SessionState::CapturingSelection);
            epoch
        };

        info!(epoch, mode = mode.label(), "session started");
        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(async move { orchestrator.run_session(epoch, mode).await });
        TriggerOutcome::Started { epoch, task }
    }

    pub async fn apply_requested(&self) -> Result<(), ApplyError> {
        let pending = self.claim_result(None).await?;
        let timings = self.config.read().await.timings;
        self.apply(pending, timings).await
    }

    /// Closes the surface and discards the session. Ignored while the
    /// clipboard is being manipulated (capture and apply), since those steps
    /// must finish their restore.
    pub async fn dismiss_requested(&self) -> bool {
        let mut session = self.session.lock().await;
        let current = session.state;
        match current {
            SessionState::AwaitingLlm | SessionState::StreamingLlm | SessionState::ResultReady => {}
            state => {
                debug!(%state, "dismiss ignored");
                return false;
            }
        }

        info!(epoch = session.epoch, state = %session.state, "session dismissed");
        self.close_locked(&mut session);
        true
    }

    async fn run_session(&self, epoch: u64, mode: ProcessingMode) {
        let config = self.config.read().await.clone();

        let capture_started = Instant::now();
        let capture = match self.capture_selection(epoch, &config.timings).await {
            Ok(capture) => capture,
            Err(err) => {
                error!(epoch, "selection capture failed: {err}");
                self.notify(&format!("Could not read the selection: {err}"), Severity::Error);
                self.finish(epoch, config.auto_apply_and_close).await;
                return;
            }
        };
        self.metrics
            .lock()
            .await
            .record_capture(elapsed_ms(capture_started));

        let (mode, text) = match (capture.selection, mode) {
            (Some(text), mode) => (mode, text),
            (
                None,
                ProcessingMode::OnDemand(instruction) | ProcessingMode::FreeGeneration(instruction),
            ) => {
                info!(epoch, "nothing selected; answering the instruction directly");
                (ProcessingMode::FreeGeneration(instruction), String::new())
            }
            (None, mode) => {
                warn!(epoch, mode = mode.label(), "no text selected");
                self.metrics.lock().await.record_invalid_selection();
                self.notify(
                    "No text selected. Select some text and try again.",
                    Severity::Warning,
                );
                self.finish(epoch, false).await;
                return;
            }
        };

        {
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                return;
            }
            session.mode = Some(mode.clone());
            session.selected_text = text.clone();
            session.context = Some(SelectionContext {
                app: capture.app,
                captured_at_ms: capture.captured_at_ms,
            });
        }

        self.process(epoch, mode, text, config).await;
    }

    /// Snapshots the foreground app and copies the selection through a
    /// sentinel, restoring the user's clipboard before returning.
    async fn capture_selection(&self, epoch: u64, timings: &Timings) -> Result<CapturedSelection, InputError> {
        let lookup = self.backends.focus.foreground_app();
        let app = match bounded("foreground application lookup", timings.backend_call, lookup).await {
            Ok(app) => app,
            Err(err) => {
                warn!(epoch, "could not identify the foreground application: {err}");
                AppIdentity::unknown()
            }
        };
        let captured_at_ms = now_epoch_ms();

        let clipboard = &self.backends.clipboard;
        let original = clipboard.read_text().await?;
        let sentinel = sentinel_marker(epoch);
        let copied = self.copy_through_sentinel(&sentinel, timings).await;
        let restored = clipboard.write_text(&original).await;
        let copied = copied?;
        restored?;

        let selection = (copied != sentinel && !copied.trim().is_empty()).then_some(copied);
        debug!(
            epoch,
            app = %app.name,
            selected_chars = selection.as_ref().map_or(0, |text| text.chars().count()),
            "selection captured"
        );

        Ok(CapturedSelection {
            app,
            selection,
            captured_at_ms,
        })
    }

    async fn copy_through_sentinel(&self, sentinel: &str, timings: &Timings) -> Result<String, InputError> {
        self.backends.clipboard.write_text(sentinel).await?;
        let copy = Chord::copy();
        bounded("copy chord", timings.backend_call, self.backends.keys.send_chord(&copy)).await?;
        tokio::time::sleep(timings.capture_settle).await;
        self.backends.clipboard.read_text().await
    }

    async fn process(&self, epoch: u64, mode: ProcessingMode, text: String, config: OrchestratorConfig) {
        let auto_apply = config.auto_apply_and_close;
        let prompt = match build_prompt(&mode, &text, &config.prompt) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(epoch, mode = mode.label(), "cannot build prompt: {err}");
                self.notify(&format!("Cannot process this request: {err}"), Severity::Error);
                self.finish(epoch, auto_apply).await;
                return;
            }
        };

        let streaming = config.llm.stream;
        let waiting = if streaming {
            SessionState::StreamingLlm
        } else {
            SessionState::AwaitingLlm
        };
        {
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                return;
            }
            session.state = waiting;
            self.backends.presentation.state_changed(waiting);
            self.backends.presentation.show_processing(&mode);
        }

        info!(
            epoch,
            mode = mode.label(),
            prompt_chars = prompt.chars().count(),
            streaming,
            "requesting completion"
        );
        let llm_started = Instant::now();
        let presentation = Arc::clone(&self.backends.presentation);
        let active_epoch = Arc::clone(&self.active_epoch);
        let mut forward = move |_delta: &str, aggregate: &str| {
            if active_epoch.load(Ordering::SeqCst) == epoch {
                presentation.update_streaming_result(&clean(aggregate));
            }
        };
        let sink = if streaming {
            Some(&mut forward as &mut (dyn FnMut(&str, &str) + Send))
        } else {
            None
        };
        let outcome = self.backends.llm.complete(&config.llm, &prompt, sink).await;
        let llm_ms = elapsed_ms(llm_started);

        let raw = match outcome {
            Ok(raw) => {
                self.metrics.lock().await.record_llm(llm_ms);
                raw
            }
            Err(err) => {
                self.metrics.lock().await.record_llm_failure();
                if !self.is_active(epoch) {
                    debug!(epoch, "ignoring failure of a dismissed session: {err}");
                    return;
                }
                warn!(epoch, elapsed_ms = llm_ms, "LLM request failed: {err}");
                self.notify(&format!("LLM request failed: {err}"), Severity::Error);
                self.finish(epoch, auto_apply).await;
                return;
            }
        };

        if !self.is_active(epoch) {
            debug!(epoch, "discarding result of a dismissed session");
            return;
        }

        let processed = clean(&raw);
        if processed.is_empty() {
            warn!(epoch, raw_chars = raw.chars().count(), "response is empty after cleaning");
            self.notify("The model returned no usable text.", Severity::Error);
            self.finish(epoch, auto_apply).await;
            return;
        }
        if processed == text.trim() {
            info!(epoch, elapsed_ms = llm_ms, "result matches the selection");
            self.notify("No changes needed.", Severity::Info);
            self.finish(epoch, true).await;
            return;
        }

        {
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                return;
            }
            session.result = Some(processed.clone());
            info!(
                epoch,
                elapsed_ms = llm_ms,
                result_chars = processed.chars().count(),
                "result ready"
            );
            if !auto_apply {
                session.state = SessionState::ResultReady;
                self.backends
                    .presentation
                    .state_changed(SessionState::ResultReady);
                self.backends.presentation.show_result(&text, &processed);
                return;
            }
        }

        match self.claim_result(Some(epoch)).await {
            Ok(pending) => {
                // Failures are reported to the surface inside `apply`.
                let _ = self.apply(pending, config.timings).await;
            }
            Err(err) => debug!(epoch, "auto-apply skipped: {err}"),
        }
    }

    /// Moves the session into `Applying`. With an epoch this is the auto-apply
    /// path straight from processing; without one it confirms a `ResultReady`
    /// session.
    async fn claim_result(&self, epoch: Option<u64>) -> Result<PendingApply, ApplyError> {
        let mut session = self.session.lock().await;
        let eligible = match epoch {
            Some(epoch) => session.epoch == epoch && session.state.is_processing(),
            None => session.state == SessionState::ResultReady,
        };
        let text = match (&session.result, eligible) {
            (Some(text), true) => text.clone(),
            _ => return Err(ApplyError::NotReady(session.state)),
        };

        session.state = SessionState::Applying;
        self.backends
            .presentation
            .state_changed(SessionState::Applying);

        Ok(PendingApply {
            epoch: session.epoch,
            text,
            target: session
                .context
                .as_ref()
                .map(|context| context.app.clone())
                .unwrap_or_else(AppIdentity::unknown),
            started_at: session.started_at,
        })
    }

    async fn apply(&self, pending: PendingApply, timings: Timings) -> Result<(), ApplyError> {
        let epoch = pending.epoch;
        let started = Instant::now();
        info!(
            epoch,
            target = %pending.target.name,
            result_chars = pending.text.chars().count(),
            "applying result"
        );

        let clipboard = &self.backends.clipboard;
        let outcome = match clipboard.read_text().await {
            Ok(original) => {
                let pasted = self.paste_into_target(&pending, &timings).await;
                tokio::time::sleep(timings.clipboard_restore).await;
                let restored = clipboard
                    .write_text(&original)
                    .await
                    .map_err(ApplyError::Clipboard);
                if let Err(err) = &restored {
                    error!(epoch, "failed to restore the clipboard: {err}");
                }
                pasted.and(restored)
            }
            Err(err) => Err(ApplyError::Clipboard(err)),
        };

        {
            let mut metrics = self.metrics.lock().await;
            match &outcome {
                Ok(()) => {
                    metrics.record_apply(elapsed_ms(started));
                    if let Some(session_started) = pending.started_at {
                        metrics.record_end_to_end(elapsed_ms(session_started));
                    }
                }
                Err(_) => metrics.record_apply_failure(),
            }
        }

        match &outcome {
            Ok(()) => info!(epoch, elapsed_ms = elapsed_ms(started), "result applied"),
            Err(err) => {
                error!(epoch, "apply failed: {err}");
                self.notify(&format!("Could not apply the result: {err}"), Severity::Error);
            }
        }

        tokio::time::sleep(timings.close_delay).await;
        let mut session = self.session.lock().await;
        if session.epoch == epoch {
            self.close_locked(&mut session);
        }
        outcome
    }

    /// Puts the result on the clipboard, confirms it stuck, then pastes into
    /// the captured application or, failing every activation, the frontmost one.
    async fn paste_into_target(&self, pending: &PendingApply, timings: &Timings) -> Result<(), ApplyError> {
        let clipboard = &self.backends.clipboard;
        clipboard
            .write_text(&pending.text)
            .await
            .map_err(ApplyError::Clipboard)?;
        let readback = clipboard.read_text().await.map_err(ApplyError::Clipboard)?;
        if readback != pending.text {
            return Err(ApplyError::Verification {
                expected_chars: pending.text.chars().count(),
                actual_chars: readback.chars().count(),
            });
        }

        let focus = &self.backends.focus;
        let keys = &self.backends.keys;
        let limit = timings.backend_call;
        let paste = Chord::paste();
        let paste = &paste;
        let (target, ()) = try_in_order(
            activation_candidates(&pending.target),
            |candidate: ActivationTarget| async move {
                bounded("application activation", limit, focus.activate(&candidate)).await?;
                tokio::time::sleep(timings.focus_settle).await;
                bounded("paste chord", limit, keys.send_chord(paste)).await
            },
            |candidate, err: &InputError| {
                warn!(epoch = pending.epoch, %candidate, "activation attempt failed: {err}");
            },
            || bounded("paste chord", limit, keys.send_chord(paste)),
        )
        .await
        .map_err(ApplyError::Paste)?;

        match target {
            Some(target) => info!(epoch = pending.epoch, %target, "pasted into the captured application"),
            None => warn!(
                epoch = pending.epoch,
                "captured application could not be activated; pasted into the frontmost window"
            ),
        }
        Ok(())
    }

    fn is_active(&self, epoch: u64) -> bool {
        self.active_epoch.load(Ordering::SeqCst) == epoch
    }

    fn notify(&self, text: &str, severity: Severity) {
        self.backends.presentation.show_message(text, severity);
    }

    /// Returns to `Idle` without passing through `Closed`.
    async fn finish(&self, epoch: u64, close_surface: bool) {
        let mut session = self.session.lock().await;
        if session.epoch != epoch {
            return;
        }
        *session = Session::idle();
        let _ = self
            .active_epoch
            .compare_exchange(epoch, 0, Ordering::SeqCst, Ordering::SeqCst);
        if close_surface {
            self.backends.presentation.close();
        }
        self.backends.presentation.state_changed(SessionState::Idle);
        debug!(epoch, "session back to idle");
    }

    fn close_locked(&self, session: &mut Session) {
        let epoch = session.epoch;
        session.state = SessionState::Closed;
        self.backends.presentation.state_changed(SessionState::Closed);
        self.backends.presentation.close();

        *session = Session::idle();
        let _ = self
            .active_epoch
            .compare_exchange(epoch, 0, Ordering::SeqCst, Ordering::SeqCst);
        self.backends.presentation.state_changed(SessionState::Idle);
        debug!(epoch, "session closed");
    }
}

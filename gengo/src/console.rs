use std::fmt;
use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::orchestrator::{Presentation, Severity};
use crate::prompt::ProcessingMode;
use crate::state::SessionState;
use crate::utils::preview;

const STREAM_PREVIEW_CHARS: usize = 72;

/// Terminal surface for `gengo serve`: notices go to stdout, state changes to
/// the log.
///
/// These calls run under the session lock, so output is best effort. A
/// daemon started detached often has no stdout at all.
pub struct ConsolePresentation {
    out: Mutex<Box<dyn Write + Send>>,
    /// A streaming preview line is open and needs a newline before other output.
    streaming_line: AtomicBool,
}

impl ConsolePresentation {
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    fn with_output(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            streaming_line: AtomicBool::new(false),
        }
    }

    /// Write errors are dropped.
    fn write(&self, text: fmt::Arguments<'_>, newline: bool) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = out.write_fmt(text);
        if newline {
            let _ = out.write_all(b"\n");
        }
        let _ = out.flush();
    }

    fn line(&self, text: fmt::Arguments<'_>) {
        self.write(text, true);
    }

    fn end_streaming_line(&self) {
        if self.streaming_line.swap(false, Ordering::SeqCst) {
            self.line(format_args!(""));
        }
    }
}

impl Default for ConsolePresentation {
    fn default() -> Self {
        Self::new()
    }
}

fn single_line(text: &str, max_chars: usize) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    preview(&joined, max_chars)
}

impl Presentation for ConsolePresentation {
    fn state_changed(&self, state: SessionState) {
        debug!(%state, "session state changed");
    }

    fn show_processing(&self, mode: &ProcessingMode) {
        self.end_streaming_line();
        self.line(format_args!("[gengo] {mode}: waiting for the model..."));
    }

    fn update_streaming_result(&self, text: &str) {
        self.write(
            format_args!("\r\x1b[2K[gengo] {}", single_line(text, STREAM_PREVIEW_CHARS)),
            false,
        );
        self.streaming_line.store(true, Ordering::SeqCst);
    }

    fn show_result(&self, original: &str, processed: &str) {
        self.end_streaming_line();
        info!(
            original_chars = original.chars().count(),
            result_chars = processed.chars().count(),
            "result shown"
        );
        self.line(format_args!(
            "[gengo] result ready (trigger again or `gengo send apply` to paste, `gengo send dismiss` to discard):"
        ));
        self.line(format_args!("{processed}"));
    }

    fn show_message(&self, text: &str, severity: Severity) {
        self.end_streaming_line();
        match severity {
            Severity::Info => info!("{text}"),
            Severity::Warning => warn!("{text}"),
            Severity::Error => error!("{text}"),
        }
        self.line(format_args!("[gengo] {}: {text}", severity.as_str()));
    }

    fn close(&self) {
        self.end_streaming_line();
        debug!("presentation closed");
    }
}

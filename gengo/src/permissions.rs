use serde::Serialize;

use crate::input::clipboard::ArboardClipboard;
use crate::input::injector::EnigoInput;
use crate::input::{ClipboardStore, InputError};
use crate::platform::{AppIdentity, default_focus_backend};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReport {
    pub clipboard: PermissionState,
    pub keystrokes: PermissionState,
    pub focus: PermissionState,
    pub guidance: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    Unknown,
}

pub async fn check_permissions() -> PermissionReport {
    let clipboard = check_clipboard_access().await;
    let keystrokes = check_keystroke_simulation();
    let focus = check_focus_lookup().await;
    build_report(clipboard, keystrokes, focus)
}

fn build_report(clipboard: PermissionState, keystrokes: PermissionState, focus: PermissionState) -> PermissionReport {
    let mut guidance = Vec::new();
    if clipboard == PermissionState::Denied {
        guidance.push("Clipboard is unavailable. On Linux make sure an X11 or Wayland session is running.".to_string());
    }
    if keystrokes == PermissionState::Denied {
        guidance.push(
            "Keystroke simulation appears blocked. Grant accessibility/automation permission to the terminal running gengo."
                .to_string(),
        );
    }
    match focus {
        PermissionState::Denied => guidance.push(
            "Foreground application lookup failed. Install xdotool (Linux) or allow System Events automation (macOS)."
                .to_string(),
        ),
        PermissionState::Unknown => guidance.push(
            "Foreground application cannot be identified here; results are pasted into whichever window is frontmost."
                .to_string(),
        ),
        PermissionState::Granted => {}
    }
    if guidance.is_empty() {
        guidance.push("Permissions look healthy.".to_string());
    }

    PermissionReport {
        clipboard,
        keystrokes,
        focus,
        guidance,
    }
}

async fn check_clipboard_access() -> PermissionState {
    match ArboardClipboard::spawn() {
        Ok(clipboard) => match clipboard.read_text().await {
            Ok(_) => PermissionState::Granted,
            Err(_) => PermissionState::Denied,
        },
        Err(_) => PermissionState::Denied,
    }
}

fn check_keystroke_simulation() -> PermissionState {
    match EnigoInput::probe() {
        Ok(()) => PermissionState::Granted,
        Err(InputError::Unsupported(_)) => PermissionState::Unknown,
        Err(err) => {
            let message = err.to_string().to_lowercase();
            if message.contains("unsupported") || message.contains("not implemented") {
                PermissionState::Unknown
            } else {
                PermissionState::Denied
            }
        }
    }
}

async fn check_focus_lookup() -> PermissionState {
    match default_focus_backend().foreground_app().await {
        Ok(identity) if identity == AppIdentity::unknown() => PermissionState::Unknown,
        Ok(_) => PermissionState::Granted,
        Err(_) => PermissionState::Denied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_report_has_single_note() {
        let report = build_report(
            PermissionState::Granted,
            PermissionState::Granted,
            PermissionState::Granted,
        );
        assert_eq!(report.guidance, vec!["Permissions look healthy.".to_string()]);
    }

    #[test]
    fn each_problem_gets_guidance() {
        let report = build_report(
            PermissionState::Denied,
            PermissionState::Denied,
            PermissionState::Unknown,
        );
        assert_eq!(report.guidance.len(), 3);
        assert!(report.guidance[1].contains("accessibility"));
        assert_eq!(
            serde_json::to_value(&report).unwrap()["keystrokes"],
            serde_json::json!("denied")
        );
    }
}

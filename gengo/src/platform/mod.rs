//! Foreground-application lookup and re-activation, one backend per host OS.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::input::InputError;

const UNKNOWN: &str = "unknown";

/// Snapshot of the application that owned focus when a selection was captured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIdentity {
    /// Process or application name as reported by the OS.
    pub name: String,
    /// Bundle identifier (macOS) or window handle (Windows, X11).
    pub stable_id: String,
    /// User-facing name or window title.
    pub display_name: String,
}

impl AppIdentity {
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN.to_string(),
            stable_id: UNKNOWN.to_string(),
            display_name: UNKNOWN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationTarget {
    DisplayName(String),
    StableId(String),
    Name(String),
}

impl ActivationTarget {
    pub fn value(&self) -> &str {
        match self {
            ActivationTarget::DisplayName(value)
            | ActivationTarget::StableId(value)
            | ActivationTarget::Name(value) => value,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActivationTarget::DisplayName(_) => "display_name",
            ActivationTarget::StableId(_) => "stable_id",
            ActivationTarget::Name(_) => "name",
        }
    }
}

impl fmt::Display for ActivationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind(), self.value())
    }
}

#[async_trait]
pub trait FocusBackend: Send + Sync {
    async fn foreground_app(&self) -> Result<AppIdentity, InputError>;
    async fn activate(&self, target: &ActivationTarget) -> Result<(), InputError>;
}

const APP_NAME_TABLE: &[(&str, &str)] = &[
    ("MSTeams", "Microsoft Teams"),
    ("Microsoft Teams", "Microsoft Teams"),
    ("Teams", "Microsoft Teams"),
    ("Slack", "Slack"),
    ("Google Chrome", "Google Chrome"),
    ("Chrome", "Google Chrome"),
    ("Safari", "Safari"),
    ("Firefox", "Firefox"),
    ("Visual Studio Code", "Visual Studio Code"),
    ("Code", "Visual Studio Code"),
    ("Xcode", "Xcode"),
    ("TextEdit", "TextEdit"),
    ("Notes", "Notes"),
    ("Mail", "Mail"),
    ("Terminal", "Terminal"),
];

const BUNDLE_ID_TABLE: &[(&str, &str)] = &[
    ("com.microsoft.teams2", "Microsoft Teams"),
    ("com.microsoft.teams", "Microsoft Teams"),
    ("com.tinyspeck.slackmacgap", "Slack"),
    ("com.google.Chrome", "Google Chrome"),
    ("com.apple.Safari", "Safari"),
    ("org.mozilla.firefox", "Firefox"),
    ("com.microsoft.VSCode", "Visual Studio Code"),
    ("com.apple.dt.Xcode", "Xcode"),
    ("com.apple.TextEdit", "TextEdit"),
    ("com.apple.Notes", "Notes"),
    ("com.apple.mail", "Mail"),
    ("com.apple.Terminal", "Terminal"),
];

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(candidate, _)| *candidate == key)
        .map(|(_, name)| *name)
}

/// Maps a raw process name to the name its application activates under,
/// consulting the bundle-identifier table when the name itself is unknown.
pub fn normalize_app_name(name: &str, stable_id: &str) -> String {
    lookup(APP_NAME_TABLE, name)
        .or_else(|| lookup(BUNDLE_ID_TABLE, stable_id))
        .map(str::to_string)
        .unwrap_or_else(|| name.to_string())
}

fn is_usable(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(UNKNOWN)
}

/// Ordered re-activation attempts for an identity: display name, then stable
/// identifier, then (normalised) raw name. Placeholders are skipped, as is a
/// name identical to the display name.
pub fn activation_candidates(identity: &AppIdentity) -> Vec<ActivationTarget> {
    let mut candidates = Vec::with_capacity(3);

    if is_usable(&identity.display_name) {
        candidates.push(ActivationTarget::DisplayName(identity.display_name.trim().to_string()));
    }
    if is_usable(&identity.stable_id) {
        candidates.push(ActivationTarget::StableId(identity.stable_id.trim().to_string()));
    }
    if is_usable(&identity.name) {
        let normalized = normalize_app_name(identity.name.trim(), identity.stable_id.trim());
        if normalized != identity.display_name.trim() {
            candidates.push(ActivationTarget::Name(normalized));
        }
    }

    candidates
}

/// Used on hosts without a focus backend: identity is unknown and every
/// activation fails, leaving Apply to paste into whatever is frontmost.
#[derive(Debug, Default)]
pub struct UnsupportedFocus;

#[async_trait]
impl FocusBackend for UnsupportedFocus {
    async fn foreground_app(&self) -> Result<AppIdentity, InputError> {
        Ok(AppIdentity::unknown())
    }

    async fn activate(&self, _target: &ActivationTarget) -> Result<(), InputError> {
        Err(InputError::Unsupported("application activation"))
    }
}

pub fn default_focus_backend() -> Arc<dyn FocusBackend> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(macos::AppleScriptFocus)
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(windows::Win32Focus)
    }
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::XdotoolFocus)
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        Arc::new(UnsupportedFocus)
    }
}

/// Longest a helper may run. `xdotool --sync` waits on the window manager and
/// `osascript` can sit behind a "Where is ...?" dialog.
#[cfg(any(target_os = "macos", target_os = "linux"))]
const HELPER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Runs a helper program and returns its trimmed stdout. The child is killed
/// when it outlives [`HELPER_TIMEOUT`].
#[cfg(any(target_os = "macos", target_os = "linux"))]
async fn run_helper(program: &str, args: &[&str]) -> Result<String, InputError> {
    let output = crate::input::bounded(program, HELPER_TIMEOUT, async {
        tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| InputError::Focus(format!("failed to run {program}: {err}")))
    })
    .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InputError::Focus(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, stable_id: &str, display_name: &str) -> AppIdentity {
        AppIdentity {
            name: name.to_string(),
            stable_id: stable_id.to_string(),
            display_name: display_name.to_string(),
        }
    }

    #[test]
    fn normalizes_known_process_names() {
        assert_eq!(normalize_app_name("Code", ""), "Visual Studio Code");
        assert_eq!(normalize_app_name("MSTeams", ""), "Microsoft Teams");
        assert_eq!(normalize_app_name("Chrome", ""), "Google Chrome");
    }

    #[test]
    fn falls_back_to_bundle_table_then_raw_name() {
        assert_eq!(normalize_app_name("Electron", "com.microsoft.VSCode"), "Visual Studio Code");
        assert_eq!(normalize_app_name("Obsidian", "md.obsidian"), "Obsidian");
    }

    #[test]
    fn candidates_follow_display_stable_name_order() {
        let candidates = activation_candidates(&identity("Code", "com.microsoft.VSCode", "Code - Insiders"));
        assert_eq!(
            candidates,
            vec![
                ActivationTarget::DisplayName("Code - Insiders".to_string()),
                ActivationTarget::StableId("com.microsoft.VSCode".to_string()),
                ActivationTarget::Name("Visual Studio Code".to_string()),
            ]
        );
    }

    #[test]
    fn placeholders_and_duplicates_are_skipped() {
        assert!(activation_candidates(&AppIdentity::unknown()).is_empty());

        let candidates = activation_candidates(&identity("Safari", "unknown", "Safari"));
        assert_eq!(candidates, vec![ActivationTarget::DisplayName("Safari".to_string())]);
    }

    #[tokio::test]
    async fn unsupported_backend_reports_unknown_identity() {
        let backend = UnsupportedFocus;
        assert_eq!(backend.foreground_app().await.unwrap(), AppIdentity::unknown());
        assert!(
            backend
                .activate(&ActivationTarget::Name("Notes".to_string()))
                .await
                .is_err()
        );
    }
}

use async_trait::async_trait;
use tracing::debug;

use super::{ActivationTarget, AppIdentity, FocusBackend, run_helper};
use crate::input::InputError;

const FRONTMOST_SCRIPT: &str = r#"tell application "System Events"
    set frontApp to first application process whose frontmost is true
    set appName to name of frontApp
    try
        set appBundle to bundle identifier of frontApp
        set appDisplayName to displayed name of frontApp
        return appName & "|" & appBundle & "|" & appDisplayName
    on error
        return appName & "|unknown|unknown"
    end try
end tell"#;

/// Focus backend driving System Events through `osascript`.
#[derive(Debug, Default)]
pub struct AppleScriptFocus;

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_frontmost_report(report: &str) -> AppIdentity {
    let mut parts = report.trim().splitn(3, '|').map(str::trim);
    let name = parts.next().unwrap_or_default().to_string();
    let stable_id = parts.next().unwrap_or("unknown").to_string();
    let display_name = parts.next().unwrap_or("unknown").to_string();
    AppIdentity {
        name,
        stable_id,
        display_name,
    }
}

fn activation_script(target: &ActivationTarget) -> String {
    match target {
        ActivationTarget::StableId(bundle_id) => {
            format!("tell application id {} to activate", quote(bundle_id))
        }
        ActivationTarget::DisplayName(name) | ActivationTarget::Name(name) => {
            format!("tell application {} to activate", quote(name))
        }
    }
}

#[async_trait]
impl FocusBackend for AppleScriptFocus {
    async fn foreground_app(&self) -> Result<AppIdentity, InputError> {
        let report = run_helper("osascript", &["-e", FRONTMOST_SCRIPT]).await?;
        let identity = parse_frontmost_report(&report);
        debug!(app = %identity.name, bundle = %identity.stable_id, "frontmost application");
        Ok(identity)
    }

    async fn activate(&self, target: &ActivationTarget) -> Result<(), InputError> {
        let script = activation_script(target);
        run_helper("osascript", &["-e", script.as_str()])
            .await
            .map(|_| ())
    }
}

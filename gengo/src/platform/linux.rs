use async_trait::async_trait;
use tracing::debug;

use super::{ActivationTarget, AppIdentity, FocusBackend, run_helper};
use crate::input::InputError;

/// X11 focus backend built on the `xdotool` command.
#[derive(Debug, Default)]
pub struct XdotoolFocus;

/// Anchored, escaped `--name`/`--class` pattern so titles match literally.
fn exact_pattern(value: &str) -> String {
    format!("^{}$", regex::escape(value))
}

async fn process_name(pid: &str) -> String {
    match tokio::fs::read_to_string(format!("/proc/{pid}/comm")).await {
        Ok(comm) => comm.trim().to_string(),
        Err(_) => String::new(),
    }
}

#[async_trait]
impl FocusBackend for XdotoolFocus {
    async fn foreground_app(&self) -> Result<AppIdentity, InputError> {
        let window_id = run_helper("xdotool", &["getactivewindow"]).await?;
        let title = run_helper("xdotool", &["getwindowname", window_id.as_str()])
            .await
            .unwrap_or_default();
        let name = match run_helper("xdotool", &["getwindowpid", window_id.as_str()]).await {
            Ok(pid) => process_name(&pid).await,
            Err(_) => String::new(),
        };

        debug!(window_id = %window_id, app = %name, "active window");
        Ok(AppIdentity {
            name,
            stable_id: window_id,
            display_name: title,
        })
    }

    async fn activate(&self, target: &ActivationTarget) -> Result<(), InputError> {
        match target {
            ActivationTarget::StableId(window_id) => {
                run_helper("xdotool", &["windowactivate", "--sync", window_id.as_str()]).await?;
            }
            ActivationTarget::DisplayName(title) => {
                let pattern = exact_pattern(title);
                run_helper(
                    "xdotool",
                    &["search", "--limit", "1", "--name", pattern.as_str(), "windowactivate", "--sync"],
                )
                .await?;
            }
            ActivationTarget::Name(name) => {
                let pattern = exact_pattern(name);
                run_helper(
                    "xdotool",
                    &["search", "--limit", "1", "--class", pattern.as_str(), "windowactivate", "--sync"],
                )
                .await?;
            }
        }
        Ok(())
    }
}

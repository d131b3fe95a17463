use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use windows_sys::Win32::Foundation::{CloseHandle, HWND};
use windows_sys::Win32::System::Threading::{
    OpenProcess, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION, QueryFullProcessImageNameW,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    FindWindowW, GetForegroundWindow, GetWindowTextW, GetWindowThreadProcessId, IsIconic, IsWindow,
    SW_RESTORE, SetForegroundWindow, ShowWindow,
};

use super::{ActivationTarget, AppIdentity, FocusBackend};
use crate::input::{InputError, bounded};

/// `SetForegroundWindow` can block on a hung target's message queue.
const WIN32_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Win32 focus backend. Window handles travel as decimal strings so identities
/// stay `Send`.
#[derive(Debug, Default)]
pub struct Win32Focus;

fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

fn window_title(hwnd: HWND) -> String {
    let mut buffer = [0_u16; 512];
    let len = unsafe { GetWindowTextW(hwnd, buffer.as_mut_ptr(), buffer.len() as i32) };
    String::from_utf16_lossy(&buffer[..len.max(0) as usize])
}

fn process_image_stem(hwnd: HWND) -> String {
    let mut pid = 0_u32;
    unsafe {
        GetWindowThreadProcessId(hwnd, &mut pid);
        if pid == 0 {
            return String::new();
        }

        let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if process.is_null() {
            return String::new();
        }

        let mut buffer = [0_u16; 1024];
        let mut size = buffer.len() as u32;
        let ok = QueryFullProcessImageNameW(process, PROCESS_NAME_WIN32, buffer.as_mut_ptr(), &mut size);
        CloseHandle(process);
        if ok == 0 {
            return String::new();
        }

        let path = String::from_utf16_lossy(&buffer[..size as usize]);
        Path::new(&path)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn bring_to_front(hwnd: HWND) -> Result<(), InputError> {
    unsafe {
        if hwnd.is_null() || IsWindow(hwnd) == 0 {
            return Err(InputError::Focus("window no longer exists".to_string()));
        }
        if IsIconic(hwnd) != 0 {
            ShowWindow(hwnd, SW_RESTORE);
        }
        if SetForegroundWindow(hwnd) == 0 {
            return Err(InputError::Focus("SetForegroundWindow was refused".to_string()));
        }
    }
    Ok(())
}

fn activate_blocking(target: ActivationTarget) -> Result<(), InputError> {
    match target {
        ActivationTarget::StableId(handle) => {
            let raw: isize = handle
                .parse()
                .map_err(|_| InputError::Focus(format!("invalid window handle `{handle}`")))?;
            bring_to_front(raw as HWND)
        }
        ActivationTarget::DisplayName(title) => {
            let wide = to_wide(&title);
            let hwnd = unsafe { FindWindowW(std::ptr::null(), wide.as_ptr()) };
            bring_to_front(hwnd)
        }
        ActivationTarget::Name(_) => Err(InputError::Unsupported("activation by process name")),
    }
}

#[async_trait]
impl FocusBackend for Win32Focus {
    async fn foreground_app(&self) -> Result<AppIdentity, InputError> {
        let lookup = tokio::task::spawn_blocking(|| {
            let hwnd = unsafe { GetForegroundWindow() };
            if hwnd.is_null() {
                return AppIdentity::unknown();
            }
            AppIdentity {
                name: process_image_stem(hwnd),
                stable_id: (hwnd as isize).to_string(),
                display_name: window_title(hwnd),
            }
        });
        let identity = bounded("foreground window lookup", WIN32_CALL_TIMEOUT, async {
            lookup.await.map_err(|err| InputError::Worker(err.to_string()))
        })
        .await?;

        debug!(app = %identity.name, hwnd = %identity.stable_id, "foreground window");
        Ok(identity)
    }

    async fn activate(&self, target: &ActivationTarget) -> Result<(), InputError> {
        let target = target.clone();
        bounded("window activation", WIN32_CALL_TIMEOUT, async {
            tokio::task::spawn_blocking(move || activate_blocking(target))
                .await
                .map_err(|err| InputError::Worker(err.to_string()))?
        })
        .await
    }
}

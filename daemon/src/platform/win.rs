use async_trait::async_trait;
use std::time::Duration;

use super::{
    listing_or_empty, parse_pnputil, run_bounded, Platform, PlatformError, PowerAction,
    PowerCommand, SessionId,
};
use crate::devices::DeviceLine;

/// Windows hosts: `pnputil` for devices, WTS for sessions, `shutdown.exe`
/// for power.  There is no elevation step; the service account decides.
pub struct WindowsPlatform {
    enumeration_timeout: Duration,
}

impl WindowsPlatform {
    pub fn new(enumeration_timeout: Duration) -> Self {
        Self { enumeration_timeout }
    }
}

#[async_trait]
impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceLine>, PlatformError> {
        let outcome = run_bounded(
            "pnputil",
            &["/enum-devices", "/connected"],
            self.enumeration_timeout,
        )
        .await?;
        Ok(listing_or_empty("pnputil", outcome, parse_pnputil))
    }

    async fn active_session(&self) -> Result<Option<SessionId>, PlatformError> {
        tokio::task::spawn_blocking(wts::active_user_session)
            .await
            .map_err(|e| PlatformError::Query(format!("session query task failed: {e}")))?
    }

    async fn power_command_candidates(&self, action: PowerAction) -> Vec<PowerCommand> {
        match action {
            PowerAction::Shutdown => vec![PowerCommand::new("shutdown", &["/s", "/t", "0"])],
            PowerAction::Restart => vec![PowerCommand::new("shutdown", &["/r", "/t", "0"])],
        }
    }
}

mod wts {
    use windows::core::PWSTR;
    use windows::Win32::System::RemoteDesktop::{
        WTSActive, WTSEnumerateSessionsW, WTSFreeMemory, WTSQuerySessionInformationW,
        WTSUserName, WTS_CURRENT_SERVER_HANDLE, WTS_SESSION_INFOW,
    };

    use super::super::{PlatformError, SessionId};

    /// First active session with a logged-in user, skipping session 0.
    pub fn active_user_session() -> Result<Option<SessionId>, PlatformError> {
        let mut sessions: *mut WTS_SESSION_INFOW = std::ptr::null_mut();
        let mut count: u32 = 0;
        unsafe { WTSEnumerateSessionsW(WTS_CURRENT_SERVER_HANDLE, 0, 1, &mut sessions, &mut count) }
            .map_err(|e| PlatformError::Query(format!("WTSEnumerateSessionsW failed: {e}")))?;

        if sessions.is_null() {
            return Ok(None);
        }

        let infos = unsafe { std::slice::from_raw_parts(sessions, count as usize) };
        let found = infos
            .iter()
            .filter(|info| info.State == WTSActive && info.SessionId != 0)
            .find(|info| session_user(info.SessionId).is_some_and(|user| !user.is_empty()))
            .map(|info| SessionId::new(info.SessionId.to_string()));

        unsafe { WTSFreeMemory(sessions as *mut core::ffi::c_void) };
        Ok(found)
    }

    fn session_user(session_id: u32) -> Option<String> {
        let mut buffer = PWSTR::null();
        let mut bytes: u32 = 0;
        unsafe {
            WTSQuerySessionInformationW(
                WTS_CURRENT_SERVER_HANDLE,
                session_id,
                WTSUserName,
                &mut buffer,
                &mut bytes,
            )
        }
        .ok()?;

        if buffer.is_null() {
            return None;
        }
        let user = unsafe { buffer.to_string() }.ok();
        unsafe { WTSFreeMemory(buffer.0 as *mut core::ffi::c_void) };
        user
    }
}

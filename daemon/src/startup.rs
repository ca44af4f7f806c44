//! Login-time registration for the kiosk watchdog.
//!
//! `devmon register-startup` makes the host start `devmon kiosk` whenever the
//! user logs in; `devmon unregister-startup` removes that again.  Both are
//! idempotent, and removing an entry that is not there succeeds.
//!
//!   - Windows: a value under `HKCU\...\Run`.
//!   - Elsewhere: an XDG autostart desktop entry.

use anyhow::Result;
use std::path::Path;

/// Command line the host runs at login.
fn launch_command(exe: &Path) -> String {
    format!("\"{}\" kiosk", exe.display())
}

// ── Windows implementation ─────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use anyhow::{bail, Result};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS};
    use windows::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegDeleteValueW, RegOpenKeyExW, RegSetValueExW, HKEY,
        HKEY_CURRENT_USER, KEY_SET_VALUE, REG_OPTION_NON_VOLATILE, REG_SZ,
    };

    const RUN_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Run";
    const VALUE_NAME: &str = "DeviceMonitorKiosk";

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// Writes `command` to `HKCU\...\Run\DeviceMonitorKiosk`, replacing any
    /// previous value.
    pub fn register(command: &str) -> Result<()> {
        let key_w = to_wide(RUN_KEY);
        let val_w = to_wide(VALUE_NAME);
        let data_w = to_wide(command);
        let data_bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(data_w.as_ptr() as *const u8, data_w.len() * 2)
        };

        let mut hkey = HKEY::default();
        let err = unsafe {
            RegCreateKeyExW(
                HKEY_CURRENT_USER,
                PCWSTR::from_raw(key_w.as_ptr()),
                0,
                PCWSTR::null(),
                REG_OPTION_NON_VOLATILE,
                KEY_SET_VALUE,
                None,
                &mut hkey,
                None,
            )
        };
        if err != ERROR_SUCCESS {
            bail!("RegCreateKeyExW failed: {:?}", err);
        }

        let err = unsafe {
            RegSetValueExW(
                hkey,
                PCWSTR::from_raw(val_w.as_ptr()),
                0,
                REG_SZ,
                Some(data_bytes),
            )
        };
        unsafe {
            let _ = RegCloseKey(hkey);
        };

        if err != ERROR_SUCCESS {
            bail!("RegSetValueExW failed: {:?}", err);
        }
        Ok(())
    }

    pub fn unregister() -> Result<()> {
        let key_w = to_wide(RUN_KEY);
        let val_w = to_wide(VALUE_NAME);

        let mut hkey = HKEY::default();
        let err = unsafe {
            RegOpenKeyExW(
                HKEY_CURRENT_USER,
                PCWSTR::from_raw(key_w.as_ptr()),
                0,
                KEY_SET_VALUE,
                &mut hkey,
            )
        };
        if err != ERROR_SUCCESS {
            // No Run key, nothing to remove.
            return Ok(());
        }

        let err = unsafe { RegDeleteValueW(hkey, PCWSTR::from_raw(val_w.as_ptr())) };
        unsafe {
            let _ = RegCloseKey(hkey);
        };

        if err != ERROR_SUCCESS && err != ERROR_FILE_NOT_FOUND {
            bail!("RegDeleteValueW failed: {:?}", err);
        }
        Ok(())
    }
}

// ── XDG implementation ─────────────────────────────────────────────────────────

#[cfg(not(windows))]
mod imp {
    use anyhow::{anyhow, Context, Result};
    use std::path::{Path, PathBuf};

    const ENTRY_FILE_NAME: &str = "device-monitor-kiosk.desktop";

    /// `$XDG_CONFIG_HOME/autostart`, or `~/.config/autostart`.
    pub fn autostart_dir() -> Result<PathBuf> {
        let config_home = std::env::var_os("XDG_CONFIG_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .ok_or_else(|| anyhow!("neither XDG_CONFIG_HOME nor HOME is set"))?;
        Ok(config_home.join("autostart"))
    }

    pub fn desktop_entry(command: &str) -> String {
        format!(
            "[Desktop Entry]\n\
             Type=Application\n\
             Name=Device Monitor Kiosk\n\
             Comment=Keeps the station application running\n\
             Exec={command}\n\
             Terminal=false\n\
             X-GNOME-Autostart-enabled=true\n"
        )
    }

    pub fn write_entry(dir: &Path, command: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(ENTRY_FILE_NAME);
        std::fs::write(&path, desktop_entry(command))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn remove_entry(dir: &Path) -> Result<()> {
        let path = dir.join(ENTRY_FILE_NAME);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

// ── Public API ─────────────────────────────────────────────────────────────────

/// Registers `exe kiosk` to run automatically at user login.
pub fn register_startup(exe: &Path) -> Result<()> {
    let command = launch_command(exe);
    #[cfg(windows)]
    {
        imp::register(&command)?;
        tracing::info!("Registered in Windows startup: {command}");
    }
    #[cfg(not(windows))]
    {
        let path = imp::write_entry(&imp::autostart_dir()?, &command)?;
        tracing::info!("Registered autostart entry {}: {command}", path.display());
    }
    Ok(())
}

/// Removes the login-time registration.
pub fn unregister_startup() -> Result<()> {
    #[cfg(windows)]
    {
        imp::unregister()?;
        tracing::info!("Removed from Windows startup registry");
    }
    #[cfg(not(windows))]
    {
        imp::remove_entry(&imp::autostart_dir()?)?;
        tracing::info!("Removed autostart entry");
    }
    Ok(())
}

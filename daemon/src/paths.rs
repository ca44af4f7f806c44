//! Canonical file paths for the daemon's data files.
//!
//! Everything lives in one application data directory:
//!   - config.toml  Operator-edited, watched for changes.
//!   - status.toml  Written by `devmon run`.
//!   - logs/        Daily-rolling log files.
//!
//! `DEVMON_HOME` overrides the location on every platform.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

pub const HOME_ENV: &str = "DEVMON_HOME";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const LOG_DIR_NAME: &str = "logs";

#[cfg(windows)]
const APP_DIR_NAME: &str = "DeviceMonitor";
#[cfg(not(windows))]
const APP_DIR_NAME: &str = "device-monitor";

/// Returns the application data directory.
pub fn app_data_dir() -> Result<PathBuf> {
    resolve_data_dir(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
}

fn resolve_data_dir(var: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(home) = var(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }

    #[cfg(windows)]
    {
        var("APPDATA")
            .map(|appdata| PathBuf::from(appdata).join(APP_DIR_NAME))
            .ok_or_else(|| anyhow!("APPDATA environment variable not set"))
    }
    #[cfg(not(windows))]
    {
        if let Some(config_home) = var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(config_home).join(APP_DIR_NAME));
        }
        var("HOME")
            .map(|home| PathBuf::from(home).join(".config").join(APP_DIR_NAME))
            .ok_or_else(|| anyhow!("neither XDG_CONFIG_HOME nor HOME is set"))
    }
}

/// Returns the full path to the config file.
pub fn config_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

/// Returns the full path to the status file.
pub fn status_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(STATUS_FILE_NAME))
}

/// Returns the directory the rolling log files are written to.
pub fn log_dir() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(LOG_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn home_override_wins() {
        let dir = resolve_data_dir(env(&[
            ("DEVMON_HOME", "/srv/devmon"),
            ("APPDATA", "/appdata"),
            ("XDG_CONFIG_HOME", "/xdg"),
            ("HOME", "/home/op"),
        ]))
        .unwrap();
        assert_eq!(dir, PathBuf::from("/srv/devmon"));
    }

    #[cfg(not(windows))]
    #[test]
    fn xdg_config_home_is_preferred_over_home() {
        let dir = resolve_data_dir(env(&[("XDG_CONFIG_HOME", "/xdg"), ("HOME", "/home/op")])).unwrap();
        assert_eq!(dir, PathBuf::from("/xdg/device-monitor"));
    }

    #[cfg(not(windows))]
    #[test]
    fn falls_back_to_dot_config() {
        let dir = resolve_data_dir(env(&[("HOME", "/home/op")])).unwrap();
        assert_eq!(dir, PathBuf::from("/home/op/.config/device-monitor"));
    }

    #[cfg(windows)]
    #[test]
    fn uses_appdata_on_windows() {
        let dir = resolve_data_dir(env(&[("APPDATA", r"C:\Users\op\AppData\Roaming")])).unwrap();
        assert!(dir.ends_with("DeviceMonitor"));
    }

    #[test]
    fn no_usable_variable_is_an_error() {
        assert!(resolve_data_dir(env(&[])).is_err());
    }

    #[test]
    fn data_files_share_the_same_directory() {
        let config = config_file_path();
        let status = status_file_path();
        if let (Ok(config), Ok(status)) = (config, status) {
            assert_eq!(config.parent(), status.parent());
            assert_eq!(config.file_name().unwrap(), CONFIG_FILE_NAME);
            assert_eq!(status.file_name().unwrap(), STATUS_FILE_NAME);
        }
    }
}

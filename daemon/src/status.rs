use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::devices::DeviceStatusSnapshot;

/// Whether the presence monitor is scanning.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringState {
    Active,
    Paused,
    Stopped,
}

/// Whether the supervised application is running.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationState {
    Idle,
    Running,
}

/// Runtime status written by `devmon run` to `<data dir>/status.toml`.
/// Other tools read this file to display what the station is doing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConsoleStatus {
    /// Binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// RFC 3339 timestamp of the last update.
    pub updated_at: String,
    pub monitoring: MonitoringState,
    pub application: ApplicationState,
    /// Executable of the running (or last launched) application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    /// Human-readable message for the most recent non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Latest device table.  Kept last: TOML tables must follow plain values.
    #[serde(default)]
    pub devices: DeviceStatusSnapshot,
}

impl ConsoleStatus {
    /// Constructs the initial status on startup: monitor stopped, nothing running.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            updated_at: now(),
            monitoring: MonitoringState::Stopped,
            application: ApplicationState::Idle,
            executable: None,
            pid: None,
            last_exit_code: None,
            error: None,
            devices: DeviceStatusSnapshot::default(),
        }
    }

    /// Refreshes `updated_at`; call before each write.
    pub fn touch(&mut self) {
        self.updated_at = now();
    }
}

impl Default for ConsoleStatus {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> String {
    chrono::Local::now().to_rfc3339()
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write never stops the console.
pub fn write_status(path: &Path, status: &ConsoleStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                tracing::warn!("Failed to write status file: {e}");
            }
        }
        Err(e) => tracing::warn!("Failed to serialize status: {e}"),
    }
}

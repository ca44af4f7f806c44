use anyhow::{bail, Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::devices::LogicalDevice;
use crate::event::ConsoleEvent;

pub const DEFAULT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_ERROR_BACKOFF_FACTOR: u32 = 5;
pub const DEFAULT_STATUS_CHANNEL_CAPACITY: usize = 16;
pub const DEFAULT_ENUMERATION_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;
pub const DEFAULT_SESSION_CHECK_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 5;
pub const DEFAULT_KIOSK_ARG: &str = "--kiosk";
pub const DEFAULT_KIOSK_ENV: &str = "KIOSK";
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Upper bounds keep every derived delay far from `Duration` overflow.
const MAX_INTERVAL_MS: u64 = 60 * 60 * 1000;
const MAX_ERROR_BACKOFF_FACTOR: u64 = 100;
const MAX_TIMEOUT_SECS: u64 = 60 * 60;
const MAX_SESSION_CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Root configuration structure. Deserialized from `config.toml` in the
/// application data directory.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default = "default_devices")]
    pub devices: Vec<LogicalDevice>,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub kiosk: KioskConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            devices: default_devices(),
            launcher: LauncherConfig::default(),
            kiosk: KioskConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Scan-loop tuning for the presence monitor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MonitorConfig {
    /// Delay between scan cycles in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Multiplier applied to the interval after a failed cycle.
    #[serde(default = "default_error_backoff_factor")]
    pub error_backoff_factor: u32,
    /// Number of undelivered status messages held before updates are dropped.
    #[serde(default = "default_status_channel_capacity")]
    pub status_channel_capacity: usize,
    /// Upper bound on a single hardware listing call.
    #[serde(default = "default_enumeration_timeout_secs")]
    pub enumeration_timeout_secs: u64,
    /// How long `stop` waits for the scan loop before aborting it.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            error_backoff_factor: DEFAULT_ERROR_BACKOFF_FACTOR,
            status_channel_capacity: DEFAULT_STATUS_CHANNEL_CAPACITY,
            enumeration_timeout_secs: DEFAULT_ENUMERATION_TIMEOUT_SECS,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_secs(self.enumeration_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Settings for operator-initiated launches.
#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    /// Executable launched by the `launch` console command when no path is given.
    pub executable: Option<PathBuf>,
    /// Time a terminated application gets to exit before it is killed.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            executable: None,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
        }
    }
}

impl LauncherConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Settings for the unattended kiosk watchdog.
#[derive(Debug, Clone, Deserialize)]
pub struct KioskConfig {
    /// Workload started in kiosk mode. Falls back to `launcher.executable`.
    pub executable: Option<PathBuf>,
    #[serde(default = "default_session_check_interval_secs")]
    pub session_check_interval_secs: u64,
    /// Consecutive failed launches tolerated before the watchdog gives up.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Command-line flag appended to the workload's arguments. Empty disables it.
    #[serde(default = "default_kiosk_arg")]
    pub kiosk_arg: String,
    /// Environment variable set to `1` for the workload.
    #[serde(default = "default_kiosk_env")]
    pub kiosk_env: String,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            executable: None,
            session_check_interval_secs: DEFAULT_SESSION_CHECK_INTERVAL_SECS,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            kiosk_arg: DEFAULT_KIOSK_ARG.to_string(),
            kiosk_env: DEFAULT_KIOSK_ENV.to_string(),
        }
    }
}

impl KioskConfig {
    pub fn session_check_interval(&self) -> Duration {
        Duration::from_secs(self.session_check_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write a daily-rolling log file under the data directory.
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: true,
        }
    }
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}
fn default_error_backoff_factor() -> u32 {
    DEFAULT_ERROR_BACKOFF_FACTOR
}
fn default_status_channel_capacity() -> usize {
    DEFAULT_STATUS_CHANNEL_CAPACITY
}
fn default_enumeration_timeout_secs() -> u64 {
    DEFAULT_ENUMERATION_TIMEOUT_SECS
}
fn default_stop_timeout_secs() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}
fn default_grace_period_secs() -> u64 {
    DEFAULT_GRACE_PERIOD_SECS
}
fn default_session_check_interval_secs() -> u64 {
    DEFAULT_SESSION_CHECK_INTERVAL_SECS
}
fn default_max_restart_attempts() -> u32 {
    DEFAULT_MAX_RESTART_ATTEMPTS
}
fn default_kiosk_arg() -> String {
    DEFAULT_KIOSK_ARG.to_string()
}
fn default_kiosk_env() -> String {
    DEFAULT_KIOSK_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_true() -> bool {
    true
}

/// The three logical devices the console ships with: one 4750 unit and up to
/// two 4761 units sharing a signature.
pub fn default_devices() -> Vec<LogicalDevice> {
    vec![
        LogicalDevice::new("4750", "1809", "4750"),
        LogicalDevice::new("4761", "1809", "4761").with_secondary("4761_1"),
    ]
}

impl Config {
    /// Rejects settings that would stall or spin the background loops.
    pub fn validate(&self) -> Result<()> {
        let monitor = &self.monitor;
        within("monitor.interval_ms", monitor.interval_ms, 1, MAX_INTERVAL_MS)?;
        within(
            "monitor.error_backoff_factor",
            u64::from(monitor.error_backoff_factor),
            1,
            MAX_ERROR_BACKOFF_FACTOR,
        )?;
        within(
            "monitor.enumeration_timeout_secs",
            monitor.enumeration_timeout_secs,
            1,
            MAX_TIMEOUT_SECS,
        )?;
        within("monitor.stop_timeout_secs", monitor.stop_timeout_secs, 1, MAX_TIMEOUT_SECS)?;
        if monitor.status_channel_capacity == 0 {
            bail!("monitor.status_channel_capacity must be greater than zero");
        }
        within(
            "launcher.grace_period_secs",
            self.launcher.grace_period_secs,
            0,
            MAX_TIMEOUT_SECS,
        )?;
        within(
            "kiosk.session_check_interval_secs",
            self.kiosk.session_check_interval_secs,
            1,
            MAX_SESSION_CHECK_INTERVAL_SECS,
        )?;
        if self.kiosk.max_restart_attempts == 0 {
            bail!("kiosk.max_restart_attempts must be greater than zero");
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.vendor_id.trim().is_empty() || device.product_id.trim().is_empty() {
                bail!("device '{}' has an empty vendor or product id", device.name);
            }
            for name in device.logical_names() {
                if name.trim().is_empty() {
                    bail!("device names must not be empty");
                }
                if !seen.insert(name.to_string()) {
                    bail!("duplicate device name '{name}'");
                }
            }
        }
        Ok(())
    }

    /// The workload the kiosk watchdog supervises.
    pub fn kiosk_executable(&self) -> Option<&Path> {
        self.kiosk
            .executable
            .as_deref()
            .or(self.launcher.executable.as_deref())
    }
}

fn within(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        bail!("{name} must be between {min} and {max}, got {value}");
    }
    Ok(())
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read, parsed or validated.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<ConsoleEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!("Failed to create config watcher: {e}");
            return;
        }
    };

    // Editors often save by writing a new file and renaming it over the old
    // one, which only shows up on the directory.
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            tracing::warn!("Config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::warn!("Failed to watch config directory {}: {e}", watch_dir.display());
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(ConsoleEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to reload config: {e:#}"),
            }
        }
    }
}

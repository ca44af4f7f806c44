mod cli;
mod config;
mod console;
mod devices;
mod event;
mod logging;
mod monitor;
mod paths;
mod platform;
mod power;
mod startup;
mod status;
mod supervisor;
mod watchdog;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::platform::Platform;
use crate::power::SystemController;
use crate::supervisor::{Callbacks, ProcessSupervisor};
use crate::watchdog::{KioskWorkload, SessionWatchdog, WatchdogExit, WatchdogSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => paths::config_file_path()?,
    };
    let (config, config_error) = match config::load_or_default(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    // ── Logging ───────────────────────────────────────────────────────────────
    let log_dir = paths::log_dir().ok();
    let _log_guard = logging::init(&config.logging, cli.verbose, log_dir.as_deref())?;
    if let Some(e) = config_error {
        tracing::error!("Config error (using defaults): {e:#}");
    }

    let platform = platform::current(config.monitor.enumeration_timeout());
    tracing::info!(
        "devmon v{} starting on {}",
        env!("CARGO_PKG_VERSION"),
        platform.name()
    );

    match cli.command {
        Command::Run { launch } => {
            let status_path = paths::status_file_path()?;
            console::run(config, config_path, status_path, platform, launch).await
        }
        Command::Kiosk { executable } => run_kiosk(config, platform, executable).await,
        Command::Devices => {
            let snapshot = monitor::scan_once(platform.as_ref(), &config.devices)
                .await
                .context("Device scan failed")?;
            print!("{}", console::render_devices(&snapshot));
            Ok(())
        }
        Command::Shutdown => {
            let command = SystemController::new(platform).shutdown().await?;
            println!("Dispatched: {command}");
            Ok(())
        }
        Command::Restart => {
            let command = SystemController::new(platform).restart().await?;
            println!("Dispatched: {command}");
            Ok(())
        }
        Command::RegisterStartup => {
            let exe = std::env::current_exe().context("Failed to locate devmon executable")?;
            startup::register_startup(&exe)
        }
        Command::UnregisterStartup => startup::unregister_startup(),
    }
}

/// `devmon kiosk`: keep the workload alive until Ctrl+C.
async fn run_kiosk(
    config: Config,
    platform: Arc<dyn Platform>,
    executable: Option<PathBuf>,
) -> Result<()> {
    let Some(executable) = executable.or_else(|| config.kiosk_executable().map(PathBuf::from))
    else {
        bail!("No kiosk executable configured; set [kiosk] executable or pass --executable");
    };

    let supervisor =
        ProcessSupervisor::new(Callbacks::default()).with_grace_period(config.launcher.grace_period());
    let workload = Arc::new(KioskWorkload::new(supervisor, executable, &config.kiosk));
    tracing::info!("Kiosk workload: {}", workload.executable().display());
    let watchdog = SessionWatchdog::new(platform, workload, WatchdogSettings::from(&config.kiosk));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; stopping kiosk watchdog");
            let _ = shutdown_tx.send(true);
        }
    });

    let exit = watchdog
        .run(shutdown_rx)
        .instrument(tracing::info_span!("watchdog"))
        .await;
    match exit {
        WatchdogExit::Shutdown => Ok(()),
        WatchdogExit::Exhausted => bail!(
            "Kiosk application could not be started after {} attempts",
            config.kiosk.max_restart_attempts
        ),
    }
}

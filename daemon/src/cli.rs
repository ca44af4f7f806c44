use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "devmon")]
#[command(about = "Watches for station hardware and keeps the station application running")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to config.toml in the data directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Monitor devices and take operator commands from stdin
    Run {
        /// Application to launch right away
        #[arg(long, value_name = "PATH")]
        launch: Option<PathBuf>,
    },
    /// Keep the kiosk application running while a user is logged in
    Kiosk {
        /// Application to supervise (overrides the config file)
        #[arg(long, value_name = "PATH")]
        executable: Option<PathBuf>,
    },
    /// Scan once and print the device table
    Devices,
    /// Power off the host
    Shutdown,
    /// Reboot the host
    Restart,
    /// Start `devmon kiosk` automatically at login
    RegisterStartup,
    /// Remove the login-time registration
    UnregisterStartup,
}

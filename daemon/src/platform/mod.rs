//! Host capability interface.
//!
//! Everything that differs between host families (how devices are listed,
//! how the active login session is found, which power commands exist) sits
//! behind [`Platform`].  One implementation per family is selected at startup
//! by [`current`]; the monitor, watchdog and power controller only ever see
//! the trait object.

mod listing;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod win;

#[cfg(test)]
pub mod fake;

#[cfg(any(unix, test))]
pub use listing::parse_lsusb;
#[cfg(windows)]
pub use listing::parse_pnputil;

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::devices::DeviceLine;

/// Errors a platform query can surface to a polling loop.
///
/// Missing tools and non-zero exits are not errors here; they are folded
/// into "nothing found" by the individual capabilities.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Query(String),
}

/// An interactive login session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Session 0 hosts services, never a user desktop.
    pub fn is_system(&self) -> bool {
        self.0 == "0"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Shutdown,
    Restart,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerAction::Shutdown => f.write_str("shutdown"),
            PowerAction::Restart => f.write_str("restart"),
        }
    }
}

/// A host command that performs a power transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Runs through the host's elevation helper.
    pub elevated: bool,
}

impl PowerCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            elevated: false,
        }
    }

    /// Wraps `program args…` in `sudo`.
    pub fn elevated(program: &str, args: &[&str]) -> Self {
        let mut wrapped = vec![program];
        wrapped.extend_from_slice(args);
        Self {
            elevated: true,
            ..Self::new("sudo", &wrapped)
        }
    }
}

impl fmt::Display for PowerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Host capabilities used by the background loops.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Short host-family label for logs.
    fn name(&self) -> &'static str;

    /// Lists attached devices.  An unavailable backend, a failing listing
    /// command or a timeout yields an empty listing.
    async fn enumerate_devices(&self) -> Result<Vec<DeviceLine>, PlatformError>;

    /// The interactive session currently attached to the console, if any.
    async fn active_session(&self) -> Result<Option<SessionId>, PlatformError>;

    /// Power commands for `action` in the order they should be tried.
    async fn power_command_candidates(&self, action: PowerAction) -> Vec<PowerCommand>;

    /// Existence check: can `program` be resolved on this host?
    fn command_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    /// Starts `command` without waiting for it.
    fn dispatch(&self, command: &PowerCommand) -> std::io::Result<()> {
        Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(drop)
    }
}

/// Returns the capability implementation for the host this binary runs on.
pub fn current(enumeration_timeout: Duration) -> Arc<dyn Platform> {
    #[cfg(unix)]
    {
        Arc::new(unix::UnixPlatform::new(enumeration_timeout))
    }
    #[cfg(windows)]
    {
        Arc::new(win::WindowsPlatform::new(enumeration_timeout))
    }
}

/// Outcome of running a short-lived listing or query command.
#[derive(Debug)]
pub(crate) enum CommandOutcome {
    /// Exited successfully; carries stdout.
    Output(String),
    /// The program is missing or cannot be executed.
    Unavailable,
    /// Ran but exited unsuccessfully.
    Failed(Option<i32>),
    TimedOut,
}

/// Runs `program args…` with a deadline, capturing stdout.
///
/// The child is killed if the deadline passes.
pub(crate) async fn run_bounded(
    program: &str,
    args: &[&str],
    limit: Duration,
) -> Result<CommandOutcome, PlatformError> {
    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).kill_on_drop(true);

    match tokio::time::timeout(limit, command.output()).await {
        Err(_) => Ok(CommandOutcome::TimedOut),
        Ok(Err(e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) =>
        {
            Ok(CommandOutcome::Unavailable)
        }
        Ok(Err(source)) => Err(PlatformError::Io {
            program: program.to_string(),
            source,
        }),
        Ok(Ok(output)) if !output.status.success() => Ok(CommandOutcome::Failed(output.status.code())),
        Ok(Ok(output)) => Ok(CommandOutcome::Output(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        )),
    }
}

/// Folds a listing command into device lines, absorbing every transient failure.
pub(crate) fn listing_or_empty(
    program: &str,
    outcome: CommandOutcome,
    parse: fn(&str) -> Vec<DeviceLine>,
) -> Vec<DeviceLine> {
    match outcome {
        CommandOutcome::Output(stdout) => parse(&stdout),
        CommandOutcome::Unavailable => {
            tracing::debug!("{program} is not available; reporting no devices");
            Vec::new()
        }
        CommandOutcome::Failed(code) => {
            tracing::debug!("{program} exited with {code:?}; reporting no devices");
            Vec::new()
        }
        CommandOutcome::TimedOut => {
            tracing::warn!("{program} timed out; reporting no devices for this cycle");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevated_command_prefixes_sudo() {
        let cmd = PowerCommand::elevated("shutdown", &["-h", "now"]);
        assert_eq!(cmd.program, "sudo");
        assert_eq!(cmd.args, vec!["shutdown", "-h", "now"]);
        assert!(cmd.elevated);
        assert_eq!(cmd.to_string(), "sudo shutdown -h now");
    }

    #[test]
    fn session_zero_is_system() {
        assert!(SessionId::new("0").is_system());
        assert!(!SessionId::new("2").is_system());
        assert!(!SessionId::new("c1").is_system());
    }

    #[test]
    fn failed_listing_is_empty() {
        assert!(listing_or_empty("lsusb", CommandOutcome::Failed(Some(1)), parse_lsusb).is_empty());
        assert!(listing_or_empty("lsusb", CommandOutcome::TimedOut, parse_lsusb).is_empty());
        assert!(listing_or_empty("lsusb", CommandOutcome::Unavailable, parse_lsusb).is_empty());
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let outcome = run_bounded(
            "devmon-definitely-not-installed",
            &[],
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, CommandOutcome::Unavailable));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_failed() {
        let outcome = run_bounded("sh", &["-c", "exit 3"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Failed(Some(3))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let outcome = run_bounded("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::TimedOut));
    }
}

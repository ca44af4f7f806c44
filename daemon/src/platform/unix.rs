use async_trait::async_trait;
use std::time::Duration;

use super::{
    listing_or_empty, parse_lsusb, run_bounded, Platform, PlatformError, PowerAction, PowerCommand,
    CommandOutcome, SessionId,
};
use crate::devices::DeviceLine;

const SUDO_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const LOGINCTL_TIMEOUT: Duration = Duration::from_secs(5);

/// POSIX hosts: `lsusb` for devices, `loginctl` for sessions, `sudo` for
/// privileged power commands.
pub struct UnixPlatform {
    enumeration_timeout: Duration,
}

impl UnixPlatform {
    pub fn new(enumeration_timeout: Duration) -> Self {
        Self { enumeration_timeout }
    }

    /// `sudo -n true` succeeds only when no password prompt would appear.
    async fn sudo_is_passwordless(&self) -> bool {
        matches!(
            run_bounded("sudo", &["-n", "true"], SUDO_CHECK_TIMEOUT).await,
            Ok(CommandOutcome::Output(_))
        )
    }

    async fn seat_session(&self) -> Result<Option<SessionId>, PlatformError> {
        let outcome = run_bounded(
            "loginctl",
            &["show-seat", "seat0", "-p", "ActiveSession", "--value"],
            LOGINCTL_TIMEOUT,
        )
        .await?;

        let id = match outcome {
            CommandOutcome::Output(stdout) => stdout.trim().to_string(),
            CommandOutcome::Unavailable | CommandOutcome::Failed(_) => return Ok(display_session()),
            CommandOutcome::TimedOut => {
                return Err(PlatformError::Query("loginctl show-seat timed out".into()))
            }
        };
        if id.is_empty() {
            return Ok(None);
        }

        let session = SessionId::new(id);
        if session.is_system() {
            return Ok(None);
        }

        let user = run_bounded(
            "loginctl",
            &["show-session", session.as_str(), "-p", "Name", "--value"],
            LOGINCTL_TIMEOUT,
        )
        .await?;
        match user {
            CommandOutcome::Output(name) if !name.trim().is_empty() => {
                tracing::debug!("Active session {session} belongs to {}", name.trim());
                Ok(Some(session))
            }
            _ => Ok(None),
        }
    }
}

/// Without logind, a graphical session is assumed when this process was
/// started inside one.
fn display_session() -> Option<SessionId> {
    ["WAYLAND_DISPLAY", "DISPLAY"].iter().find_map(|var| {
        std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| SessionId::new(format!("display{v}")))
    })
}

const SHUTDOWN_COMMANDS: &[(&str, &[&str])] = &[
    ("shutdown", &["-h", "now"]),
    ("poweroff", &[]),
    ("halt", &["-p"]),
];
const RESTART_COMMANDS: &[(&str, &[&str])] = &[("reboot", &[]), ("shutdown", &["-r", "now"])];

/// Elevated variants come first when sudo can run without a prompt; the
/// plain variants always follow.
fn candidates(commands: &[(&str, &[&str])], elevated: bool) -> Vec<PowerCommand> {
    let sudo = commands
        .iter()
        .filter(|_| elevated)
        .map(|(program, args)| PowerCommand::elevated(program, args));
    let plain = commands
        .iter()
        .map(|(program, args)| PowerCommand::new(program, args));
    sudo.chain(plain).collect()
}

#[async_trait]
impl Platform for UnixPlatform {
    fn name(&self) -> &'static str {
        "posix"
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceLine>, PlatformError> {
        let outcome = run_bounded("lsusb", &[], self.enumeration_timeout).await?;
        Ok(listing_or_empty("lsusb", outcome, parse_lsusb))
    }

    async fn active_session(&self) -> Result<Option<SessionId>, PlatformError> {
        self.seat_session().await
    }

    async fn power_command_candidates(&self, action: PowerAction) -> Vec<PowerCommand> {
        let elevated = self.command_exists("sudo") && self.sudo_is_passwordless().await;
        tracing::debug!("Building {action} candidates (elevated: {elevated})");
        match action {
            PowerAction::Shutdown => candidates(SHUTDOWN_COMMANDS, elevated),
            PowerAction::Restart => candidates(RESTART_COMMANDS, elevated),
        }
    }
}

use crate::config::Config;
use crate::console::UserCommand;
use crate::monitor::MonitorMessage;

/// Everything the console event loop reacts to.
pub enum ConsoleEvent {
    /// Forwarded from the presence monitor's status channel.
    Monitor(MonitorMessage),
    /// Lifecycle callback from the process supervisor.
    App(AppEvent),
    /// An operator command read from stdin.
    Command(UserCommand),
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// Ctrl+C received; the console should clean up and exit.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Started(u32),
    Finished(i32),
    Error(String),
}

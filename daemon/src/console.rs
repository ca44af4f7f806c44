//! Headless operator console (`devmon run`).
//!
//! Owns the presence monitor, the process supervisor and the power
//! controller, and funnels everything that can happen to them into one event
//! channel: monitor messages, supervisor callbacks, stdin commands, config
//! reloads and Ctrl+C.  Each event updates `status.toml`.

use anyhow::Result;
use std::fmt::Write as _;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::{self, Config};
use crate::devices::DeviceStatusSnapshot;
use crate::event::{AppEvent, ConsoleEvent};
use crate::monitor::{MonitorMessage, MonitorSettings, PresenceMonitor, StopOutcome};
use crate::platform::Platform;
use crate::power::SystemController;
use crate::status::{self, ApplicationState, ConsoleStatus, MonitoringState};
use crate::supervisor::{Callbacks, ProcessSupervisor};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A line typed by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Pause,
    Resume,
    /// Launch the given executable, or the configured one.
    Launch(Option<PathBuf>),
    Terminate,
    Shutdown,
    Restart,
    Status,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown command '{0}' (try: pause, resume, launch [path], terminate, shutdown, restart, status, quit)")]
pub struct UnknownCommand(String);

impl FromStr for UserCommand {
    type Err = UnknownCommand;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let command = match (word.to_ascii_lowercase().as_str(), rest) {
            ("pause", "") => UserCommand::Pause,
            ("resume", "") => UserCommand::Resume,
            ("launch", "") => UserCommand::Launch(None),
            ("launch", path) => UserCommand::Launch(Some(PathBuf::from(path))),
            ("terminate" | "kill", "") => UserCommand::Terminate,
            ("shutdown", "") => UserCommand::Shutdown,
            ("restart" | "reboot", "") => UserCommand::Restart,
            ("status", "") => UserCommand::Status,
            ("quit" | "exit", "") => UserCommand::Quit,
            _ => return Err(UnknownCommand(line.to_string())),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    config: Config,
    platform: Arc<dyn Platform>,
    monitor: PresenceMonitor,
    supervisor: ProcessSupervisor,
    power: SystemController,
    status: ConsoleStatus,
    status_path: PathBuf,
    launch_override: Option<PathBuf>,
    event_tx: mpsc::Sender<ConsoleEvent>,
}

impl Console {
    /// Builds the console and the receiving end of its event channel.
    pub fn new(
        config: Config,
        platform: Arc<dyn Platform>,
        status_path: PathBuf,
        launch_override: Option<PathBuf>,
    ) -> (Self, mpsc::Receiver<ConsoleEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let supervisor = ProcessSupervisor::new(app_callbacks(event_tx.clone()))
            .with_grace_period(config.launcher.grace_period());
        let monitor = new_monitor(&platform, &config);
        let console = Self {
            power: SystemController::new(Arc::clone(&platform)),
            config,
            platform,
            monitor,
            supervisor,
            status: ConsoleStatus::new(),
            status_path,
            launch_override,
            event_tx,
        };
        (console, event_rx)
    }

    pub fn sender(&self) -> mpsc::Sender<ConsoleEvent> {
        self.event_tx.clone()
    }

    fn launch_target(&self) -> Option<&Path> {
        self.launch_override
            .as_deref()
            .or(self.config.launcher.executable.as_deref())
    }

    /// Starts scanning and forwards monitor messages into the event channel.
    pub fn start_monitor(&mut self) {
        match self.monitor.start() {
            Ok(rx) => {
                tokio::spawn(forward_monitor(rx, self.event_tx.clone()));
                self.status.monitoring = MonitoringState::Active;
            }
            Err(e) => tracing::warn!("Could not start presence monitor: {e}"),
        }
        self.publish();
    }

    pub async fn handle(&mut self, event: ConsoleEvent) -> Flow {
        match event {
            ConsoleEvent::Monitor(MonitorMessage::DeviceStatus(snapshot)) => {
                if snapshot != self.status.devices {
                    log_changes(&self.status.devices, &snapshot);
                    self.status.devices = snapshot;
                    self.publish();
                }
            }
            ConsoleEvent::Monitor(MonitorMessage::Error(e)) => {
                self.status.error = Some(format!("Device scan failed: {e}"));
                self.publish();
            }
            ConsoleEvent::App(app) => {
                match app {
                    AppEvent::Started(pid) => tracing::info!("Application started (pid {pid})"),
                    AppEvent::Finished(code) => {
                        tracing::info!("Application exited with code {code}");
                        self.status.last_exit_code = Some(code);
                    }
                    AppEvent::Error(e) => {
                        self.status.error = Some(format!("Application error: {e}"));
                    }
                }
                self.publish();
            }
            ConsoleEvent::Command(command) => return self.run_command(command).await,
            ConsoleEvent::ConfigReloaded(config) => self.apply_config(config).await,
            ConsoleEvent::Shutdown => {
                tracing::info!("Interrupted; shutting down");
                return Flow::Quit;
            }
        }
        Flow::Continue
    }

    async fn run_command(&mut self, command: UserCommand) -> Flow {
        tracing::debug!("Operator command: {command:?}");
        match command {
            UserCommand::Pause if self.monitor.is_paused() => {
                tracing::info!("Monitoring is already paused");
            }
            UserCommand::Pause => match self.monitor.pause() {
                Ok(()) => self.status.monitoring = MonitoringState::Paused,
                Err(e) => tracing::warn!("Cannot pause: {e}"),
            },
            UserCommand::Resume => match self.monitor.resume() {
                Ok(()) => self.status.monitoring = MonitoringState::Active,
                Err(e) => tracing::warn!("Cannot resume: {e}"),
            },
            UserCommand::Launch(path) => {
                let target = path.or_else(|| self.launch_target().map(Path::to_path_buf));
                match target {
                    Some(target) => match self.supervisor.launch(&target) {
                        Ok(_) => {
                            self.status.executable = Some(target.display().to_string());
                            self.status.last_exit_code = None;
                            self.status.error = None;
                        }
                        Err(e) => self.status.error = Some(e.to_string()),
                    },
                    None => {
                        tracing::warn!("No executable configured; use `launch <path>`");
                        self.status.error = Some("no executable configured".to_string());
                    }
                }
            }
            UserCommand::Terminate => {
                if let Err(e) = self.supervisor.terminate().await {
                    self.status.error = Some(e.to_string());
                }
            }
            UserCommand::Shutdown => {
                if let Err(e) = self.power.shutdown().await {
                    self.status.error = Some(e.to_string());
                }
            }
            UserCommand::Restart => {
                if let Err(e) = self.power.restart().await {
                    self.status.error = Some(e.to_string());
                }
            }
            UserCommand::Status => {
                self.refresh_application();
                println!("{}", render_status(&self.status));
                return Flow::Continue;
            }
            UserCommand::Quit => return Flow::Quit,
        }
        self.publish();
        Flow::Continue
    }

    async fn apply_config(&mut self, config: Config) {
        tracing::info!("Config reloaded");
        self.supervisor.set_grace_period(config.launcher.grace_period());

        let rescan = config.devices != self.config.devices || config.monitor != self.config.monitor;
        self.config = config;

        if rescan && self.monitor.is_running() {
            tracing::info!("Device settings changed; restarting presence monitor");
            self.monitor.stop().await;
            self.monitor = new_monitor(&self.platform, &self.config);
            self.status.devices = DeviceStatusSnapshot::default();
            self.start_monitor();
        }
    }

    /// Stops the application and the monitor, then records the final state.
    pub async fn shut_down(&mut self) {
        if self.supervisor.is_running() {
            if let Err(e) = self.supervisor.terminate().await {
                tracing::error!("Failed to stop application: {e}");
            }
        }
        match self.monitor.stop().await {
            StopOutcome::Forced => tracing::warn!("Presence monitor was aborted"),
            StopOutcome::Graceful | StopOutcome::NotRunning => {}
        }
        self.status.monitoring = MonitoringState::Stopped;
        self.publish();
    }

    fn refresh_application(&mut self) {
        self.status.pid = self.supervisor.pid();
        self.status.application = if self.status.pid.is_some() {
            ApplicationState::Running
        } else {
            ApplicationState::Idle
        };
    }

    fn publish(&mut self) {
        self.refresh_application();
        self.status.touch();
        status::write_status(&self.status_path, &self.status);
    }
}

fn new_monitor(platform: &Arc<dyn Platform>, config: &Config) -> PresenceMonitor {
    PresenceMonitor::new(
        Arc::clone(platform),
        config.devices.clone(),
        MonitorSettings::from(&config.monitor),
    )
}

/// Supervisor callbacks run outside the event loop; they only enqueue.
fn app_callbacks(tx: mpsc::Sender<ConsoleEvent>) -> Callbacks {
    let send = move |event: AppEvent| {
        if tx.try_send(ConsoleEvent::App(event)).is_err() {
            tracing::warn!("Console event channel full; dropping application event");
        }
    };
    let (started, finished, error) = (send.clone(), send.clone(), send);
    Callbacks::default()
        .on_started(move |pid| started(AppEvent::Started(pid)))
        .on_finished(move |code| finished(AppEvent::Finished(code)))
        .on_error(move |e| error(AppEvent::Error(e)))
}

async fn forward_monitor(mut rx: mpsc::Receiver<MonitorMessage>, tx: mpsc::Sender<ConsoleEvent>) {
    while let Some(message) = rx.recv().await {
        if tx.send(ConsoleEvent::Monitor(message)).await.is_err() {
            break;
        }
    }
}

fn log_changes(previous: &DeviceStatusSnapshot, current: &DeviceStatusSnapshot) {
    for (name, status) in current.iter() {
        let was_connected = previous.get(name).is_some_and(|s| s.connected);
        if status.connected != was_connected {
            if status.connected {
                tracing::info!("Device {name} connected ({})", status.instances.join(", "));
            } else {
                tracing::info!("Device {name} disconnected");
            }
        }
    }
}

pub fn render_status(status: &ConsoleStatus) -> String {
    let mut out = String::new();
    let monitoring = match status.monitoring {
        MonitoringState::Active => "active",
        MonitoringState::Paused => "paused",
        MonitoringState::Stopped => "stopped",
    };
    let _ = writeln!(out, "monitoring:  {monitoring}");
    match (status.application, status.pid) {
        (ApplicationState::Running, Some(pid)) => {
            let exe = status.executable.as_deref().unwrap_or("?");
            let _ = writeln!(out, "application: running (pid {pid}) {exe}");
        }
        _ => {
            let _ = writeln!(out, "application: idle");
        }
    }
    if let Some(code) = status.last_exit_code {
        let _ = writeln!(out, "last exit:   {code}");
    }
    if let Some(error) = &status.error {
        let _ = writeln!(out, "last error:  {error}");
    }
    out.push_str(&render_devices(&status.devices));
    out
}

/// One line per logical device.
pub fn render_devices(devices: &DeviceStatusSnapshot) -> String {
    let width = devices.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (name, status) in devices.iter() {
        if status.connected {
            let _ = writeln!(
                out,
                "{name:<width$}  connected ({})",
                status.instances.join(", ")
            );
        } else {
            let _ = writeln!(out, "{name:<width$}  disconnected");
        }
    }
    out
}

/// Reads operator commands from stdin on a plain OS thread.
///
/// A blocked read cannot be cancelled, so it must stay off the runtime: the
/// thread is simply abandoned when the process exits.
fn spawn_command_reader(tx: mpsc::Sender<ConsoleEvent>) {
    let spawned = std::thread::Builder::new()
        .name("stdin-commands".into())
        .spawn(move || read_commands(std::io::stdin().lock(), &tx));
    if let Err(e) = spawned {
        tracing::warn!("Failed to start the stdin reader: {e}; commands are disabled");
    }
}

/// Forwards one command per line until the input ends or the console is gone.
fn read_commands(input: impl BufRead, tx: &mpsc::Sender<ConsoleEvent>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to read stdin: {e}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<UserCommand>() {
            Ok(command) => {
                if tx.blocking_send(ConsoleEvent::Command(command)).is_err() {
                    return;
                }
            }
            Err(e) => eprintln!("{e}"),
        }
    }
    tracing::debug!("stdin closed; no more operator commands");
}

/// `devmon run`: the console event loop.
pub async fn run(
    config: Config,
    config_path: PathBuf,
    status_path: PathBuf,
    platform: Arc<dyn Platform>,
    launch: Option<PathBuf>,
) -> Result<()> {
    let launch_now = launch.is_some();
    let (mut console, mut event_rx) = Console::new(config, platform, status_path, launch);

    tokio::spawn(config::watch_config(config_path, console.sender()));
    spawn_command_reader(console.sender());
    {
        let tx = console.sender();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(ConsoleEvent::Shutdown).await;
            }
        });
    }

    console.start_monitor();
    if launch_now {
        console
            .handle(ConsoleEvent::Command(UserCommand::Launch(None)))
            .await;
    }

    async {
        while let Some(event) = event_rx.recv().await {
            if console.handle(event).await == Flow::Quit {
                break;
            }
        }
        console.shut_down().await;
    }
    .instrument(tracing::info_span!("console"))
    .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceLine;
    use crate::platform::fake::FakePlatform;
    use crate::platform::PowerCommand;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn console(fake: &Arc<FakePlatform>, dir: &Path) -> (Console, mpsc::Receiver<ConsoleEvent>) {
        let mut config = Config::default();
        config.monitor.interval_ms = 50;
        Console::new(
            config,
            Arc::clone(fake) as Arc<dyn Platform>,
            dir.join("status.toml"),
            None,
        )
    }

    fn written(dir: &Path) -> ConsoleStatus {
        toml::from_str(&std::fs::read_to_string(dir.join("status.toml")).unwrap()).unwrap()
    }

    // ── command parsing ───────────────────────────────────────────────────────

    #[test]
    fn parses_every_command() {
        assert_eq!("pause".parse(), Ok(UserCommand::Pause));
        assert_eq!("  RESUME ".parse(), Ok(UserCommand::Resume));
        assert_eq!("launch".parse(), Ok(UserCommand::Launch(None)));
        assert_eq!(
            "launch /opt/station app/run".parse(),
            Ok(UserCommand::Launch(Some(PathBuf::from("/opt/station app/run"))))
        );
        assert_eq!("terminate".parse(), Ok(UserCommand::Terminate));
        assert_eq!("shutdown".parse(), Ok(UserCommand::Shutdown));
        assert_eq!("restart".parse(), Ok(UserCommand::Restart));
        assert_eq!("status".parse(), Ok(UserCommand::Status));
        assert_eq!("quit".parse(), Ok(UserCommand::Quit));
    }

    #[test]
    fn rejects_unknown_commands_and_stray_arguments() {
        assert!("dance".parse::<UserCommand>().is_err());
        assert!("pause now".parse::<UserCommand>().is_err());
    }

    #[tokio::test]
    async fn command_lines_are_forwarded_from_a_plain_thread() {
        let (tx, mut rx) = mpsc::channel(1);
        let input = std::io::Cursor::new("pause\n\n  \nbogus\nlaunch /opt/app\nquit\n");
        let reader = std::thread::spawn(move || read_commands(input, &tx));

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ConsoleEvent::Command(command) = event {
                seen.push(command);
            }
        }
        assert_eq!(
            seen,
            vec![
                UserCommand::Pause,
                UserCommand::Launch(Some(PathBuf::from("/opt/app"))),
                UserCommand::Quit,
            ]
        );
        reader.join().unwrap();
    }

    /// Input that fails the test if anything reads past the first line.
    struct EndOfTest;

    impl std::io::Read for EndOfTest {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            panic!("command reader kept reading after the console closed");
        }
    }

    #[test]
    fn command_reader_stops_once_the_console_is_gone() {
        use std::io::Read;

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input = std::io::BufReader::new(std::io::Cursor::new("status\n").chain(EndOfTest));
        read_commands(input, &tx);
    }

    // ── event handling ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn device_snapshots_reach_the_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakePlatform::with_lines(vec![DeviceLine::new(
            "001:004",
            "Bus 001 Device 004: ID 1809:4750 Advantech",
        )]));
        let (mut console, mut rx) = console(&fake, dir.path());
        console.start_monitor();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ConsoleEvent::Monitor(MonitorMessage::DeviceStatus(_))));
        assert_eq!(console.handle(event).await, Flow::Continue);

        let status = written(dir.path());
        assert_eq!(status.monitoring, MonitoringState::Active);
        assert!(status.devices.get("4750").unwrap().connected);
        assert!(!status.devices.get("4761").unwrap().connected);

        console.shut_down().await;
        assert_eq!(written(dir.path()).monitoring, MonitoringState::Stopped);
    }

    #[tokio::test]
    async fn pause_and_resume_are_reflected() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakePlatform::new());
        let (mut console, _rx) = console(&fake, dir.path());
        console.start_monitor();

        console.handle(ConsoleEvent::Command(UserCommand::Pause)).await;
        assert_eq!(written(dir.path()).monitoring, MonitoringState::Paused);
        console.handle(ConsoleEvent::Command(UserCommand::Resume)).await;
        assert_eq!(written(dir.path()).monitoring, MonitoringState::Active);

        console.shut_down().await;
    }

    #[tokio::test]
    async fn pause_on_a_paused_loop_keeps_it_paused() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakePlatform::new());
        let (mut console, _rx) = console(&fake, dir.path());
        console.start_monitor();

        console.handle(ConsoleEvent::Command(UserCommand::Pause)).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !console.monitor.is_paused() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("scan loop never applied the pause");

        let flow = console.handle(ConsoleEvent::Command(UserCommand::Pause)).await;
        assert_eq!(flow, Flow::Continue);
        assert!(console.monitor.is_paused());
        assert_eq!(written(dir.path()).monitoring, MonitoringState::Paused);

        console.shut_down().await;
    }

    #[tokio::test]
    async fn launch_without_target_records_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakePlatform::new());
        let (mut console, _rx) = console(&fake, dir.path());

        console
            .handle(ConsoleEvent::Command(UserCommand::Launch(None)))
            .await;
        assert!(written(dir.path()).error.is_some());

        console
            .handle(ConsoleEvent::Command(UserCommand::Launch(Some(
                dir.path().join("missing"),
            ))))
            .await;
        let status = written(dir.path());
        assert!(status.error.unwrap().contains("not found"));
        assert_eq!(status.application, ApplicationState::Idle);
    }

    #[tokio::test]
    async fn application_exit_code_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakePlatform::new());
        let (mut console, _rx) = console(&fake, dir.path());

        console.handle(ConsoleEvent::App(AppEvent::Finished(3))).await;
        assert_eq!(written(dir.path()).last_exit_code, Some(3));
    }

    #[tokio::test]
    async fn power_failure_is_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakePlatform::new());
        *fake.candidates.lock() = vec![PowerCommand::new("poweroff", &[])];
        let (mut console, _rx) = console(&fake, dir.path());

        let flow = console
            .handle(ConsoleEvent::Command(UserCommand::Shutdown))
            .await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(fake.dispatch_attempts.load(Ordering::SeqCst), 0);
        assert!(written(dir.path()).error.unwrap().contains("poweroff"));
    }

    #[tokio::test]
    async fn quit_and_interrupt_end_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakePlatform::new());
        let (mut console, _rx) = console(&fake, dir.path());

        assert_eq!(
            console.handle(ConsoleEvent::Command(UserCommand::Quit)).await,
            Flow::Quit
        );
        assert_eq!(console.handle(ConsoleEvent::Shutdown).await, Flow::Quit);
    }

    #[tokio::test]
    async fn reload_with_new_devices_restarts_the_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakePlatform::new());
        let (mut console, _rx) = console(&fake, dir.path());
        console.start_monitor();

        let mut config = Config::default();
        config.monitor.interval_ms = 50;
        config.devices.truncate(1);
        console.handle(ConsoleEvent::ConfigReloaded(config)).await;

        assert!(console.monitor.is_running());
        assert_eq!(console.config.devices.len(), 1);
        console.shut_down().await;
    }

    // ── rendering ─────────────────────────────────────────────────────────────

    #[test]
    fn renders_device_table() {
        let snapshot = DeviceStatusSnapshot::build(
            &config::default_devices(),
            &[DeviceLine::new("001:004", "ID 1809:4761")],
        );
        let table = render_devices(&snapshot);
        assert!(table.contains("4761    connected (001:004)"));
        assert!(table.contains("4761_1  disconnected"));
        assert_eq!(table.lines().count(), 3);
    }
}
